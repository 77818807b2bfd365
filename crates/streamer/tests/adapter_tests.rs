//! Integration tests for the device adapter
//!
//! Drives a Loupedeck adapter against the in-memory host:
//! - Configuration order and handshake bytes
//! - Reset-and-retry on rejected or silent handshakes
//! - Read stream behavior, failure and cancellation

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, HostCall, MockHost, TEST_VENDOR_ID, mock_device, with_timeout,
};
use protocol::{DeviceId, EndpointSelector, TransferResult, UPGRADE_REQUEST, UsbError};
use std::time::Duration;
use streamer::{AdapterError, AdapterProfile, AdapterState, DeviceAdapter};

fn adapter(host: &MockHost) -> DeviceAdapter<MockHost> {
    let device = mock_device(1, TEST_VENDOR_ID);
    host.add_device(device.clone());
    DeviceAdapter::new(host.clone(), device, AdapterProfile::LOUPEDECK)
}

mod initialize {
    use super::*;

    #[tokio::test]
    async fn test_accepted_handshake_streams_without_reset() {
        let host = MockHost::new();
        let mut adapter = adapter(&host);

        adapter.initialize().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Streaming);
        assert_eq!(adapter.resets(), 0);
        assert_eq!(host.resets(), 0);
    }

    #[tokio::test]
    async fn test_operations_run_in_order() {
        let host = MockHost::new();
        host.set_packet_size(64);
        let mut adapter = adapter(&host);
        adapter.initialize().await.unwrap();

        let id = DeviceId(1);
        assert_eq!(
            host.calls(),
            vec![
                HostCall::Open(id),
                HostCall::SelectConfiguration(id, 1),
                HostCall::ClaimInterface(id, 1),
                HostCall::SelectAlternateSetting(id, 1, 0),
                HostCall::MaxPacketSize(id, EndpointSelector::new(1, 1, 0, 1)),
                HostCall::BulkOut(id, 0x01, UPGRADE_REQUEST.to_vec()),
                HostCall::BulkIn(id, 0x81, 64),
            ]
        );
        assert_eq!(adapter.packet_size(), Some(64));
    }

    #[tokio::test]
    async fn test_rejected_then_accepted_resets_once() {
        let host = MockHost::new();
        host.reply_to_handshake(b"HTTP/1.0 400 Bad Request");
        let mut adapter = adapter(&host);

        adapter.initialize().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Streaming);
        assert_eq!(adapter.resets(), 1);
        assert_eq!(host.resets(), 1);
        assert_eq!(host.writes(), 2);
    }

    #[tokio::test]
    async fn test_rejected_twice_fails() {
        let host = MockHost::new();
        host.reply_to_handshake(b"garbage");
        host.reply_to_handshake(b"more garbage");
        let mut adapter = adapter(&host);

        let err = adapter.initialize().await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::InitFailed(Box::new(AdapterError::HandshakeRejected {
                response: "more garbage".to_string()
            }))
        );
        assert_eq!(adapter.state(), AdapterState::Failed);
        assert_eq!(host.resets(), 1);

        // No streaming read was issued
        assert_eq!(host.reads(), 2);
    }

    #[tokio::test]
    async fn test_silent_device_times_out_then_recovers() {
        let host = MockHost::new();
        host.ignore_next_handshake();
        let mut adapter = adapter(&host);

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, adapter.initialize()).await;
        assert!(result.unwrap().is_ok());
        assert_eq!(adapter.resets(), 1);
    }

    #[tokio::test]
    async fn test_silent_device_twice_fails_with_timeout() {
        let host = MockHost::new();
        host.ignore_next_handshake();
        host.ignore_next_handshake();
        let mut adapter = adapter(&host);

        let err = adapter.initialize().await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::InitFailed(Box::new(AdapterError::HandshakeTimeout(
                Duration::from_millis(500)
            )))
        );
        assert_eq!(adapter.state(), AdapterState::Failed);
    }

    #[tokio::test]
    async fn test_transfer_error_escalates_without_reset() {
        let host = MockHost::new();
        host.fail_next_open(UsbError::NoDevice);
        let mut adapter = adapter(&host);

        let err = adapter.initialize().await.unwrap_err();
        assert_eq!(err, AdapterError::Transfer(UsbError::NoDevice));
        assert_eq!(host.resets(), 0);
    }

    #[tokio::test]
    async fn test_handshake_write_error_escalates_without_reset() {
        let host = MockHost::new();
        host.fail_next_handshake_write(UsbError::Pipe);
        let mut adapter = adapter(&host);

        let err = adapter.initialize().await.unwrap_err();
        assert_eq!(err, AdapterError::Transfer(UsbError::Pipe));
        assert_eq!(adapter.state(), AdapterState::Failed);
        assert_eq!(adapter.resets(), 0);
        assert_eq!(host.resets(), 0);
        assert_eq!(host.writes(), 1);
        assert_eq!(host.reads(), 0);
    }

    #[tokio::test]
    async fn test_second_adapter_cannot_open_busy_device() {
        let host = MockHost::new();
        let mut first = adapter(&host);
        first.initialize().await.unwrap();

        let mut second = DeviceAdapter::new(
            host.clone(),
            mock_device(1, TEST_VENDOR_ID),
            AdapterProfile::LOUPEDECK,
        );
        let err = second.initialize().await.unwrap_err();
        assert_eq!(err, AdapterError::Transfer(UsbError::Busy));

        // The failed adapter must not close the other one's handle
        drop(second);
        assert!(host.is_open(DeviceId(1)));
        assert_eq!(host.closes(), 0);
    }

    #[tokio::test]
    async fn test_failed_adapter_releases_handle_once() {
        let host = MockHost::new();
        host.reply_to_handshake(b"no");
        host.reply_to_handshake(b"no");
        let mut adapter = adapter(&host);

        assert!(adapter.initialize().await.is_err());
        adapter.destroy();
        drop(adapter);

        assert_eq!(host.closes(), 1);
        assert!(!host.is_open(DeviceId(1)));
    }
}

mod streaming {
    use super::*;

    async fn streaming_adapter(host: &MockHost) -> DeviceAdapter<MockHost> {
        let mut adapter = adapter(host);
        adapter.initialize().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_reads_one_transfer_per_pull() {
        let host = MockHost::new();
        let mut stream = streaming_adapter(&host).await.into_read_stream().unwrap();
        let before = host.reads();

        for n in 0..3u8 {
            let frame = stream.next().await.unwrap().unwrap();
            assert_eq!(frame.payload, vec![n; 4]);
        }
        assert_eq!(host.reads(), before + 3);
    }

    #[tokio::test]
    async fn test_status_results_are_yielded() {
        let host = MockHost::new();
        host.push_frame(Ok(TransferResult::stall()));
        host.push_frame(Ok(TransferResult::ok(Vec::new())));
        let mut stream = streaming_adapter(&host).await.into_read_stream().unwrap();

        assert_eq!(stream.next().await, Some(Ok(TransferResult::stall())));
        let empty = stream.next().await.unwrap().unwrap();
        assert!(empty.is_empty());
        assert_eq!(stream.state(), AdapterState::Streaming);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let host = MockHost::new();
        host.push_frame(Err(UsbError::NoDevice));
        let mut stream = streaming_adapter(&host).await.into_read_stream().unwrap();
        let before = host.reads();

        assert_eq!(
            stream.next().await,
            Some(Err(AdapterError::Transfer(UsbError::NoDevice)))
        );
        assert_eq!(stream.state(), AdapterState::Failed);
        assert!(stream.next().await.is_none());
        assert_eq!(host.reads(), before + 1);
    }

    #[tokio::test]
    async fn test_close_releases_handle_once() {
        let host = MockHost::new();
        let mut stream = streaming_adapter(&host).await.into_read_stream().unwrap();
        stream.next().await.unwrap().unwrap();

        stream.close();
        assert_eq!(host.closes(), 1);
        assert!(!host.is_open(DeviceId(1)));
    }

    #[tokio::test]
    async fn test_cancel_mid_read_closes_once_without_further_reads() {
        let host = MockHost::new();
        host.hang_reads();
        let mut stream = streaming_adapter(&host).await.into_read_stream().unwrap();

        let pending = with_timeout(Duration::from_millis(20), stream.next()).await;
        assert!(pending.is_err());
        let reads = host.reads();

        drop(stream);
        assert_eq!(host.closes(), 1);
        assert_eq!(host.reads(), reads);
    }

    #[tokio::test]
    async fn test_spawned_reader_cancelled_by_abort() {
        let host = MockHost::new();
        let stream = streaming_adapter(&host).await.into_read_stream().unwrap();

        let task = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(Ok(_)) = stream.next().await {
                tokio::task::yield_now().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        let _ = task.await;

        assert_eq!(host.closes(), 1);
        let reads = host.reads();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.reads(), reads);
    }
}
