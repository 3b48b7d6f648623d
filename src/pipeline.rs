//! Per-notification decode and forward.

use std::sync::Arc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::forwarder::{Forward, ForwardResult};
use crate::protocol::{decode, RawNotification};

/// Runs each notification through the decoder and forwarder, logging the outcome.
///
/// Failures here never touch connection state.
pub struct NotificationPipeline {
    forwarder: Arc<dyn Forward>,
    log: Arc<EventLog>,
}

impl NotificationPipeline {
    /// Create a pipeline.
    pub fn new(forwarder: Arc<dyn Forward>, log: Arc<EventLog>) -> Self {
        Self { forwarder, log }
    }

    /// Decode and forward one notification.
    ///
    /// Returns the response status on success. A payload that does not decode
    /// is never sent and comes back as [`Error::Decode`]; a failed POST comes
    /// back as [`Error::Forward`]. Both are logged before returning.
    pub async fn handle(&self, raw: RawNotification) -> Result<u16> {
        trace!("Notification data: {:02X?}", &raw.data[..raw.data.len().min(40)]);

        self.log.info(format!("BLE: {}", raw.text()));

        let event = decode(&raw).map_err(|e| {
            self.log.warn(format!("Decode error: {}", e.detail));
            Error::from(e)
        })?;

        match self.forwarder.forward(event).await {
            ForwardResult::Success { status } => {
                self.log.info("Forwarded to API.");
                Ok(status)
            }
            ForwardResult::Failure(e) => {
                self.log.warn(format!("POST error: {e}"));
                Err(e.into())
            }
        }
    }
}
