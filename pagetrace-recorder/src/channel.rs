//! Messaging between the instrumented page and the extension's background context

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{trace, warn};

use crate::events::{OutboundMessage, RecordingStatusResponse};
use crate::{RecorderError, Result};

/// Transport carrying recorder messages out of the page.
///
/// `send` is fire-and-forget: there is no delivery guarantee and callers only log failures.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Send `REQUEST_RECORDING_STATUS` and wait for the background's answer.
    async fn request_recording_status(&self) -> Result<RecordingStatusResponse>;
}

/// In-process channel backed by a tokio broadcast channel.
///
/// The recording status authority is a plain value that can be changed at any time.
pub struct LocalChannel {
    tx: broadcast::Sender<OutboundMessage>,
    recording_enabled: Mutex<Option<bool>>,
    sent: AtomicUsize,
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recording_enabled: Mutex::new(None),
            sent: AtomicUsize::new(0),
        }
    }

    /// A channel whose authority answers status requests with `enabled`.
    pub fn with_recording_enabled(enabled: bool) -> Self {
        let channel = Self::default();
        channel.set_recording_enabled(Some(enabled));
        channel
    }

    /// Set the answer to status requests. `None` makes requests fail.
    pub fn set_recording_enabled(&self, enabled: Option<bool>) {
        if let Ok(mut slot) = self.recording_enabled.lock() {
            *slot = enabled;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }

    /// Number of messages handed to the channel so far.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Get a stream of outbound messages
    pub fn message_stream(&self) -> impl Stream<Item = OutboundMessage> + Unpin {
        let mut rx = self.tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(message) => yield message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Log but continue - don't terminate stream on lag
                        warn!("Message stream lagged, skipped {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl MessageChannel for LocalChannel {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let kind = message.kind();
        if self.tx.send(message).is_err() {
            trace!(kind, "no subscribers, message dropped");
        }
        Ok(())
    }

    async fn request_recording_status(&self) -> Result<RecordingStatusResponse> {
        self.send(OutboundMessage::RequestRecordingStatus)?;
        let enabled = *self
            .recording_enabled
            .lock()
            .map_err(|e| RecorderError::State(format!("Failed to lock status: {e}")))?;
        enabled
            .map(|is_recording_enabled| RecordingStatusResponse {
                is_recording_enabled,
            })
            .ok_or_else(|| RecorderError::Channel("No recording status authority".to_string()))
    }
}
