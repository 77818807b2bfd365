//! Protocol tests
//!
//! Covers the upgrade handshake surface and the JSON shape of the types the
//! command-line front end prints.
//!
//! Run with: `cargo test -p protocol`

use protocol::{
    DeviceId, DeviceInfo, EndpointSelector, HotplugEvent, TransferResult, TransferStatus,
    UPGRADE_REQUEST, UPGRADE_RESPONSE_PREFIX, UsbError, check_upgrade_response,
};

fn create_test_device(id: u32, vendor_id: u16) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId(id),
        vendor_id,
        product_id: 0x0004,
        bus_number: 1,
        device_address: 5,
        product: Some(format!("Test Product {}", id)),
    }
}

mod handshake {
    use super::*;

    #[test]
    fn test_request_is_exact() {
        assert_eq!(
            UPGRADE_REQUEST,
            b"GET /index.html\nHTTP/1.1\nConnection: Upgrade\n\
              Upgrade: websocket\nSec-WebSocket-Key: 123abc\n\n"
        );
    }

    #[test]
    fn test_response_prefix() {
        assert_eq!(UPGRADE_RESPONSE_PREFIX, "HTTP/1.1");
    }

    #[test]
    fn test_full_packet_response_accepted() {
        // A real reply fills a whole packet with headers after the status line
        let mut packet = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n".to_vec();
        packet.resize(512, 0);
        assert!(check_upgrade_response(&packet).is_ok());
    }

    #[test]
    fn test_truncated_prefix_rejected() {
        assert!(check_upgrade_response(b"HTTP/1.").is_err());
    }
}

mod serialization {
    use super::*;

    #[test]
    fn test_device_info_json() {
        let device = create_test_device(7, 0x2ec2);
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["vendor_id"], 0x2ec2);
        assert_eq!(json["product"], "Test Product 7");
    }

    #[test]
    fn test_transfer_result_json() {
        let result = TransferResult::ok(vec![0xde, 0xad]);
        let json = serde_json::to_string(&result).unwrap();
        let parsed: TransferResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, TransferStatus::Ok);
        assert_eq!(parsed.payload, vec![0xde, 0xad]);
    }

    #[test]
    fn test_hotplug_event_json() {
        let event = HotplugEvent::Disconnected {
            bus_number: 2,
            device_address: 9,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["Disconnected"]["device_address"], 9);
    }

    #[test]
    fn test_usb_error_other_message() {
        let err = UsbError::other("USB worker unavailable");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["Other"]["message"], "USB worker unavailable");
    }
}

mod selectors {
    use super::*;

    #[test]
    fn test_selector_is_copy_and_hashable() {
        use std::collections::HashSet;

        let a = EndpointSelector::new(1, 1, 0, 1);
        let b = a;
        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }
}
