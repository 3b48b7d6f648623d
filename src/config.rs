//! Gateway configuration.
//!
//! [`GatewayConfig`] holds the two values the operator edits at runtime (the
//! backend URL and which peripheral to look for). It is shared through a
//! [`ConfigHandle`] so the UI can swap it while the gateway is running;
//! readers take one snapshot per operation.
//!
//! [`GatewayOptions`] carries everything fixed at construction time.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{FALL_CHARACTERISTIC_UUID, FALL_SERVICE_UUID, PERIPHERAL_NAME};
use crate::error::{Error, Result};

/// Default backend endpoint.
pub const DEFAULT_ENDPOINT_URL: &str = "http://localhost:3000/api/fall";

/// Environment variable holding the endpoint URL.
pub const ENDPOINT_URL_ENV: &str = "GATEWAY_ENDPOINT_URL";

/// Environment variable holding the device selector.
pub const DEVICE_SELECTOR_ENV: &str = "GATEWAY_DEVICE_SELECTOR";

/// Runtime-mutable gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GatewayConfig {
    /// Where decoded events are POSTed.
    pub endpoint_url: String,
    /// Advertised name of the peripheral to connect to.
    pub device_selector: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            device_selector: PERIPHERAL_NAME.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Create a configuration.
    pub fn new(endpoint_url: impl Into<String>, device_selector: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            device_selector: device_selector.into(),
        }
    }

    /// Read `GATEWAY_ENDPOINT_URL` and `GATEWAY_DEVICE_SELECTOR`, using the
    /// defaults for anything unset or empty.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(fallback)
        };
        Self {
            endpoint_url: read(ENDPOINT_URL_ENV, defaults.endpoint_url),
            device_selector: read(DEVICE_SELECTOR_ENV, defaults.device_selector),
        }
    }
}

/// Shared, swappable handle to the current [`GatewayConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<GatewayConfig>>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot of the current configuration.
    pub fn load(&self) -> Arc<GatewayConfig> {
        self.current.read().clone()
    }

    /// Replace the whole configuration.
    pub fn store(&self, config: GatewayConfig) {
        *self.current.write() = Arc::new(config);
    }

    /// Replace the endpoint URL.
    pub fn set_endpoint_url(&self, url: impl Into<String>) {
        let mut current = self.current.write();
        let mut next = (**current).clone();
        next.endpoint_url = url.into();
        *current = Arc::new(next);
    }

    /// Replace the device selector.
    pub fn set_device_selector(&self, selector: impl Into<String>) {
        let mut current = self.current.write();
        let mut next = (**current).clone();
        next.device_selector = selector.into();
        *current = Arc::new(next);
    }
}

impl From<GatewayConfig> for ConfigHandle {
    fn from(config: GatewayConfig) -> Self {
        Self::new(config)
    }
}

/// Construction-time gateway options.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOptions {
    /// Service advertised by the wearable.
    pub service_uuid: Uuid,
    /// Characteristic carrying fall/proximity notifications.
    pub characteristic_uuid: Uuid,
    /// Number of lines the event log retains.
    pub log_capacity: usize,
    /// Buffered notifications per subscription before new ones are dropped.
    pub notification_capacity: usize,
    /// Forwards allowed in flight per subscription. `1` preserves arrival order.
    pub forward_concurrency: usize,
    /// Timeout for one POST to the backend.
    pub http_timeout: Duration,
    /// Longest response body kept in a forward failure.
    pub max_error_body: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            service_uuid: FALL_SERVICE_UUID,
            characteristic_uuid: FALL_CHARACTERISTIC_UUID,
            log_capacity: Self::DEFAULT_LOG_CAPACITY,
            notification_capacity: 32,
            forward_concurrency: 4,
            http_timeout: Duration::from_secs(10),
            max_error_body: 512,
        }
    }
}

impl GatewayOptions {
    /// Default event log capacity.
    pub const DEFAULT_LOG_CAPACITY: usize = 200;

    /// Set the service and characteristic to subscribe to.
    pub fn with_target(mut self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self.characteristic_uuid = characteristic_uuid;
        self
    }

    /// Set the event log capacity.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Set the per-subscription notification buffer.
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Set how many forwards may run concurrently per subscription.
    pub fn with_forward_concurrency(mut self, limit: usize) -> Self {
        self.forward_concurrency = limit;
        self
    }

    /// Set the HTTP request timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Check the options for values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("log_capacity", self.log_capacity),
            ("notification_capacity", self.notification_capacity),
            ("forward_concurrency", self.forward_concurrency),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        if self.http_timeout.is_zero() {
            return Err(Error::InvalidParameter {
                name: "http_timeout".to_string(),
                value: format!("{:?}", self.http_timeout),
            });
        }
        Ok(())
    }
}
