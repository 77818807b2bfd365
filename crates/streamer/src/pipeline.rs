//! Stream pipeline
//!
//! Wires registry, adapter and read stream into one frame feed:
//! wait for the first snapshot with a device, open it through a fresh
//! adapter, stream its frames. A failed chain is rebuilt from scratch with a
//! new subscription, up to [`MAX_CHAIN_ATTEMPTS`] times in total.

use crate::adapter::{AdapterProfile, DeviceAdapter, ReadStream};
use crate::error::{AdapterError, PipelineError};
use crate::registry::DeviceRegistry;
use common::UsbHost;
use protocol::{DeviceInfo, TransferResult};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Chain attempts before the pipeline gives up
///
/// Counted over the whole life of the pipeline; a chain that streamed for a
/// while and then failed still uses up an attempt.
pub const MAX_CHAIN_ATTEMPTS: u32 = 3;

pub type FrameItem = Result<TransferResult, PipelineError>;

#[derive(Clone)]
pub struct StreamPipeline<H: UsbHost> {
    registry: DeviceRegistry<H>,
    profile: AdapterProfile,
}

impl<H: UsbHost> StreamPipeline<H> {
    pub fn new(registry: DeviceRegistry<H>, profile: AdapterProfile) -> Self {
        Self { registry, profile }
    }

    pub fn registry(&self) -> &DeviceRegistry<H> {
        &self.registry
    }

    pub fn profile(&self) -> &AdapterProfile {
        &self.profile
    }

    /// Pull-based frame feed
    pub fn frames(&self) -> FrameStream<H> {
        FrameStream {
            registry: self.registry.clone(),
            profile: self.profile,
            attempts: 0,
            active: None,
            finished: false,
        }
    }

    /// Push frames into a bounded channel from a background task
    ///
    /// Dropping the receiver stops the task and releases the device. The
    /// terminal error, if any, is the last item sent.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<FrameItem> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut frames = self.frames();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = frames.next() => item,
                    _ = tx.closed() => {
                        debug!("Frame subscriber went away");
                        break;
                    }
                };

                let Some(item) = item else { break };
                let terminal = item.is_err();
                if tx.send(item).await.is_err() || terminal {
                    break;
                }
            }
            debug!("Frame subscription task finished");
        });

        rx
    }
}

/// Frames of whichever device the current chain is attached to
///
/// Ends (`None`) after yielding [`PipelineError::Exhausted`].
pub struct FrameStream<H: UsbHost> {
    registry: DeviceRegistry<H>,
    profile: AdapterProfile,
    attempts: u32,
    active: Option<ReadStream<H>>,
    finished: bool,
}

impl<H: UsbHost> FrameStream<H> {
    /// Chains started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Device of the active chain
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.active.as_ref().map(|s| s.device())
    }

    pub async fn next(&mut self) -> Option<FrameItem> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(stream) = self.active.as_mut() {
                let failure = match stream.next().await {
                    Some(Ok(frame)) => return Some(Ok(frame)),
                    Some(Err(e)) => e,
                    None => AdapterError::InvalidState {
                        state: stream.state(),
                        operation: "read",
                    },
                };
                self.active = None;
                if let Some(err) = self.give_up(failure) {
                    return Some(Err(err));
                }
                continue;
            }

            self.attempts += 1;
            info!(
                "Starting stream chain (attempt {}/{})",
                self.attempts, MAX_CHAIN_ATTEMPTS
            );
            match self.start_chain().await {
                Ok(stream) => self.active = Some(stream),
                Err(e) => {
                    if let Some(err) = self.give_up(e) {
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Record a chain failure; `Some` once no attempts are left
    fn give_up(&mut self, failure: AdapterError) -> Option<PipelineError> {
        if self.attempts >= MAX_CHAIN_ATTEMPTS {
            error!(
                "Stream chain failed {} times, giving up: {}",
                self.attempts, failure
            );
            self.finished = true;
            Some(PipelineError::Exhausted {
                attempts: self.attempts,
                last: failure,
            })
        } else {
            warn!(
                "Stream chain failed (attempt {}/{}): {}",
                self.attempts, MAX_CHAIN_ATTEMPTS, failure
            );
            None
        }
    }

    async fn start_chain(&self) -> Result<ReadStream<H>, AdapterError> {
        let mut changes = self.registry.changes();
        let device = loop {
            let snapshot = changes.next().await;
            if let Some(device) = snapshot.first() {
                break device.clone();
            }
            debug!("No device attached, waiting");
        };

        let mut adapter = DeviceAdapter::new(self.registry.host().clone(), device, self.profile);
        adapter.initialize().await?;
        adapter.into_read_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockHost, TEST_VENDOR_ID, mock_device};
    use protocol::UsbError;

    fn pipeline(host: &MockHost) -> StreamPipeline<MockHost> {
        let registry = DeviceRegistry::new(host.clone(), TEST_VENDOR_ID);
        StreamPipeline::new(registry, AdapterProfile::LOUPEDECK)
    }

    #[tokio::test]
    async fn test_first_frame_counts_one_attempt() {
        let host = MockHost::new();
        host.add_device(mock_device(1, TEST_VENDOR_ID));
        let mut frames = pipeline(&host).frames();

        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame.payload, vec![0, 0, 0, 0]);
        assert_eq!(frames.attempts(), 1);
        assert_eq!(frames.device().map(|d| d.id.0), Some(1));
    }

    #[tokio::test]
    async fn test_exhausted_stream_ends() {
        let host = MockHost::new();
        host.add_device(mock_device(1, TEST_VENDOR_ID));
        for _ in 0..MAX_CHAIN_ATTEMPTS {
            host.fail_next_open(UsbError::Io);
        }
        let mut frames = pipeline(&host).frames();

        let err = frames.next().await.unwrap().unwrap_err();
        assert_eq!(
            err,
            PipelineError::Exhausted {
                attempts: 3,
                last: AdapterError::Transfer(UsbError::Io),
            }
        );
        assert!(frames.next().await.is_none());
    }
}
