//! Gateway envelope construction.
//!
//! The envelope is the decoded event with a `gateway` object appended:
//!
//! ```json
//! { "type": "fall", "...": "...", "gateway": { "platform": "linux", "receivedAt": 1700000000000 } }
//! ```

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};

use super::decoder::DecodedEvent;

/// Key under which gateway metadata is attached.
pub const GATEWAY_KEY: &str = "gateway";

/// Metadata the gateway appends to every forwarded event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GatewayMetadata {
    /// Host platform tag.
    pub platform: String,
    /// Receipt time in milliseconds since the Unix epoch.
    pub received_at: i64,
}

impl GatewayMetadata {
    fn to_value(&self) -> Value {
        json!({
            "platform": self.platform,
            "receivedAt": self.received_at,
        })
    }
}

/// An event plus gateway metadata; the unit sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEnvelope {
    body: Map<String, Value>,
    metadata: GatewayMetadata,
}

impl GatewayEnvelope {
    /// Merge metadata into an event.
    ///
    /// The metadata is written last, so an event field named `gateway` is
    /// replaced.
    pub fn new(event: DecodedEvent, metadata: GatewayMetadata) -> Self {
        let mut body = event.into_fields();
        body.insert(GATEWAY_KEY.to_string(), metadata.to_value());
        Self { body, metadata }
    }

    /// The merged JSON object.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// The metadata that was merged in.
    pub fn metadata(&self) -> &GatewayMetadata {
        &self.metadata
    }

    /// The envelope as a JSON value.
    pub fn to_json(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// Wall-clock source for `receivedAt` that never repeats a value.
///
/// Two events stamped within the same millisecond get consecutive values.
#[derive(Debug, Default)]
pub struct ReceiptClock {
    last: AtomicI64,
}

impl ReceiptClock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp using the current wall-clock time.
    pub fn now(&self) -> i64 {
        self.stamp(crate::utils::epoch_millis())
    }

    /// Stamp using an explicit wall-clock reading.
    pub fn stamp(&self, wall_millis: i64) -> i64 {
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall_millis.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decoder::decode_bytes;
    use pretty_assertions::assert_eq;

    fn metadata(received_at: i64) -> GatewayMetadata {
        GatewayMetadata {
            platform: "linux".to_string(),
            received_at,
        }
    }

    #[test]
    fn test_envelope_appends_gateway_object() {
        let event = decode_bytes(br#"{"type":"fall","id":7}"#).unwrap();
        let envelope = GatewayEnvelope::new(event, metadata(42));

        assert_eq!(
            envelope.to_json(),
            json!({
                "type": "fall",
                "id": 7,
                "gateway": { "platform": "linux", "receivedAt": 42 }
            })
        );
    }

    #[test]
    fn test_gateway_key_collision_is_last_write_wins() {
        let event = decode_bytes(br#"{"gateway":"spoofed"}"#).unwrap();
        let envelope = GatewayEnvelope::new(event, metadata(1));

        assert_eq!(
            envelope.body().get(GATEWAY_KEY),
            Some(&json!({ "platform": "linux", "receivedAt": 1 }))
        );
        assert_eq!(envelope.body().len(), 1);
    }

    #[test]
    fn test_receipt_clock_is_strictly_increasing() {
        let clock = ReceiptClock::new();
        assert_eq!(clock.stamp(100), 100);
        assert_eq!(clock.stamp(100), 101);
        assert_eq!(clock.stamp(100), 102);
        assert_eq!(clock.stamp(500), 500);
        // A wall clock stepping backwards still moves forward.
        assert_eq!(clock.stamp(10), 501);
    }

    #[test]
    fn test_receipt_clock_now_increases() {
        let clock = ReceiptClock::new();
        let mut previous = clock.now();
        for _ in 0..100 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }
}
