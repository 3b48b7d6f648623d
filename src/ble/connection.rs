//! Connection state for the gateway.

/// Lifecycle of one gateway connection attempt.
///
/// `Disconnected` and `Error` end an attempt; a fresh `connect()` restarts
/// at `Scanning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Waiting for the configured peripheral to advertise.
    Scanning,
    /// Establishing the link.
    Connecting,
    /// Looking up the service and characteristic.
    Discovering,
    /// Notifications are armed and being relayed.
    Subscribed,
    /// The peripheral dropped the link while subscribed.
    Disconnected,
    /// The attempt failed.
    Error,
}

impl ConnectionState {
    /// Check if notifications are being relayed.
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Subscribed)
    }

    /// Check if the attempt has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}
