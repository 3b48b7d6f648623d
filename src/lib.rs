// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-fall-gateway
//!
//! A cross-platform Rust library that relays fall and proximity events from a
//! Bluetooth Low Energy wearable to an HTTP backend.
//!
//! The gateway scans for a single peripheral by advertised name, subscribes
//! to its notification characteristic, decodes each notification as a JSON
//! object and POSTs it, stamped with gateway metadata, to a configurable
//! endpoint.
//!
//! ## Features
//!
//! - **Connection State Machine**: `Idle → Scanning → Connecting → Discovering → Subscribed`,
//!   with `Disconnected` on link loss and `Error` for failed attempts
//! - **Two Transports**: a native central backend and a single-shot
//!   device-requester backend behind one [`Transport`] interface
//! - **Fault Isolation**: malformed payloads and HTTP failures are logged and
//!   never disturb the connection
//! - **Event Log**: bounded, newest-first status lines for an operator display
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_fall_gateway::{
//!     CentralTransport, ConfigHandle, Gateway, GatewayConfig, GatewayOptions, Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = Arc::new(CentralTransport::new().await?);
//!     let config = ConfigHandle::new(GatewayConfig::from_env());
//!     let gateway = Gateway::with_http(transport, config, GatewayOptions::default())?;
//!
//!     let _log = gateway.on_log(|entry| println!("{}", entry));
//!     gateway.connect().await;
//!
//!     let _ = tokio::signal::ctrl_c().await;
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types
//! - `testing`: Expose `FakeTransport` and the `mockall` mocks to downstream tests

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod event_log;
pub mod forwarder;
pub mod gateway;
pub mod pipeline;
pub mod protocol;
pub mod utils;

// Re-exports for convenience
pub use config::{ConfigHandle, GatewayConfig, GatewayOptions};
pub use error::{Error, ErrorKind, Result};
pub use event_log::{EventLog, LogEntry, LogLevel};
pub use forwarder::{Forward, ForwardError, ForwardResult, HttpForwarder};
pub use gateway::{AttemptFailure, CallbackHandle, Gateway, GatewayStatus};
pub use pipeline::NotificationPipeline;

// Re-export commonly used types from submodules
pub use ble::{
    CentralTransport, ConnectionState, PeripheralHandle, RequesterTransport, ServiceFilter,
    Transport,
};
pub use protocol::{DecodedEvent, EventKind, GatewayEnvelope, GatewayMetadata, RawNotification};
