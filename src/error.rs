//! Error types for the ble-fall-gateway crate.

use thiserror::Error;

use crate::forwarder::ForwardError;
use crate::protocol::DecodeError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The adapter failed while scanning for peripherals.
    #[error("Scan error: {reason}")]
    Scan {
        /// The adapter's message.
        reason: String,
    },

    /// Failed to establish a link to the peripheral.
    #[error("Connect error: {reason}")]
    Link {
        /// The adapter's message.
        reason: String,
    },

    /// Service not found on the peripheral.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the peripheral.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Arming the notification subscription failed.
    #[error("Subscribe error: {reason}")]
    Subscribe {
        /// The adapter's message.
        reason: String,
    },

    /// The transport has no peripheral (or link) under this identifier.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// A notification payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A decoded event could not be delivered to the backend.
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error into the gateway's failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bluetooth(_) | Self::BluetoothUnavailable | Self::Scan { .. } => ErrorKind::Scan,
            Self::Link { .. } | Self::PeripheralNotFound { .. } => ErrorKind::Link,
            Self::ServiceNotFound { .. } | Self::CharacteristicNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::Subscribe { .. } => ErrorKind::Subscribe,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Forward(_) => ErrorKind::Forward,
            Self::InvalidParameter { .. } | Self::Internal(_) => ErrorKind::Other,
        }
    }
}

/// Coarse classification of gateway failures.
///
/// `Scan`, `Link`, `NotFound` and `Subscribe` end a connection attempt;
/// `Decode` and `Forward` only ever affect a single notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Radio/adapter-level failure while discovering.
    Scan,
    /// Link establishment failed.
    Link,
    /// Expected service or characteristic is absent.
    NotFound,
    /// Notification subscription could not be armed.
    Subscribe,
    /// Payload was not UTF-8 JSON.
    Decode,
    /// HTTP delivery failed.
    Forward,
    /// Anything else.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Scan => "ScanError",
            Self::Link => "LinkError",
            Self::NotFound => "NotFoundError",
            Self::Subscribe => "SubscribeError",
            Self::Decode => "DecodeError",
            Self::Forward => "ForwardError",
            Self::Other => "Error",
        };
        f.write_str(name)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
