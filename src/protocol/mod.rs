//! Payload handling.
//!
//! Decodes notification bytes from the wearable and wraps decoded events in
//! the envelope sent to the backend.

pub mod decoder;
pub mod envelope;

pub use decoder::{decode, DecodeError, DecodeReason, DecodedEvent, EventKind, RawNotification};
pub use envelope::{GatewayEnvelope, GatewayMetadata, ReceiptClock, GATEWAY_KEY};
