//! BLE communication module.
//!
//! This module provides the transport capability interface the gateway is
//! written against, and its implementations.

pub mod central;
pub mod connection;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod requester;
pub mod transport;
pub mod uuids;

pub use central::CentralTransport;
pub use connection::ConnectionState;
pub use requester::{DeviceChooser, PreferSelector, RequesterTransport};
pub use transport::{
    DiscoveryStream, Link, NotificationSink, PeripheralHandle, ServiceFilter, Subscription,
    SubscriptionHandle, SubscriptionTarget, Transport,
};
pub use uuids::*;
