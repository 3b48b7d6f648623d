//! HTTP delivery of decoded events.
//!
//! Each event is wrapped in a [`GatewayEnvelope`] and POSTed once, as JSON,
//! to the endpoint currently configured. The forwarder never retries.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigHandle, GatewayOptions};
use crate::error::{Error, Result};
use crate::protocol::{DecodedEvent, GatewayEnvelope, GatewayMetadata, ReceiptClock};
use crate::utils::truncate_utf8;

/// Why a forward failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// No endpoint URL is configured.
    #[error("no endpoint URL configured")]
    MissingEndpoint,

    /// The endpoint answered outside 2xx.
    #[error("{status} {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The request never got a response (DNS, refused, timeout, bad URL).
    #[error("{detail}")]
    Network {
        /// The underlying error text.
        detail: String,
    },
}

/// Outcome of one forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResult {
    /// The endpoint answered 2xx.
    Success {
        /// HTTP status code.
        status: u16,
    },
    /// Delivery failed.
    Failure(ForwardError),
}

impl ForwardResult {
    /// Check if the event was accepted.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The HTTP status, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Success { status } => Some(*status),
            Self::Failure(ForwardError::Status { status, .. }) => Some(*status),
            Self::Failure(_) => None,
        }
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&ForwardError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(e) => Some(e),
        }
    }
}

/// Sends decoded events to the backend.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Forward: Send + Sync {
    /// Deliver one event.
    async fn forward(&self, event: DecodedEvent) -> ForwardResult;
}

/// [`Forward`] implementation over `reqwest`.
pub struct HttpForwarder {
    client: reqwest::Client,
    config: ConfigHandle,
    clock: ReceiptClock,
    platform: String,
    max_error_body: usize,
}

impl HttpForwarder {
    /// Create a forwarder tagging events with `platform`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: ConfigHandle,
        platform: impl Into<String>,
        options: &GatewayOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.http_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            clock: ReceiptClock::new(),
            platform: platform.into(),
            max_error_body: options.max_error_body,
        })
    }

    /// Wrap an event with this gateway's metadata.
    pub fn envelope(&self, event: DecodedEvent) -> GatewayEnvelope {
        let metadata = GatewayMetadata {
            platform: self.platform.clone(),
            received_at: self.clock.now(),
        };
        GatewayEnvelope::new(event, metadata)
    }

    /// POST an envelope to the configured endpoint.
    pub async fn post(&self, envelope: &GatewayEnvelope) -> ForwardResult {
        let config = self.config.load();
        let url = config.endpoint_url.trim();
        if url.is_empty() {
            return ForwardResult::Failure(ForwardError::MissingEndpoint);
        }

        debug!("POST {} ({} fields)", url, envelope.body().len());

        let response = match self.client.post(url).json(&envelope.to_json()).send().await {
            Ok(r) => r,
            Err(e) => {
                return ForwardResult::Failure(ForwardError::Network {
                    detail: error_chain(&e),
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            return ForwardResult::Success {
                status: status.as_u16(),
            };
        }

        let body = match response.text().await {
            Ok(text) => truncate_utf8(&text, self.max_error_body),
            Err(e) => {
                warn!("Failed to read error response body: {}", e);
                String::new()
            }
        };

        ForwardResult::Failure(ForwardError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    async fn forward(&self, event: DecodedEvent) -> ForwardResult {
        let envelope = self.envelope(event);
        self.post(&envelope).await
    }
}

/// Render an error with its sources, `outer: inner: root`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
