//! Notification payload decoding.
//!
//! The wearable writes a UTF-8 JSON object to the fall characteristic. The
//! shape of that object is owned by the firmware; this layer only checks that
//! it is well formed and hands the fields on untouched.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// A raw notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    /// The notification bytes.
    pub data: Bytes,
    /// When the transport received the notification.
    pub received_at: DateTime<Utc>,
}

impl RawNotification {
    /// Create a notification stamped with the current time.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            received_at: Utc::now(),
        }
    }

    /// Lossy text rendering, for log lines.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Why a payload failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeReason {
    /// The bytes are not valid UTF-8.
    Encoding,
    /// The text is not a JSON object.
    Json,
}

/// Error produced by [`decode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode error ({reason:?}): {detail}")]
pub struct DecodeError {
    /// The failing stage.
    pub reason: DecodeReason,
    /// Human-readable description from the parser.
    pub detail: String,
}

impl DecodeError {
    fn encoding(err: std::str::Utf8Error) -> Self {
        Self {
            reason: DecodeReason::Encoding,
            detail: err.to_string(),
        }
    }

    fn json(detail: impl Into<String>) -> Self {
        Self {
            reason: DecodeReason::Json,
            detail: detail.into(),
        }
    }
}

/// What a decoded event reports, read from its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// The wearer fell.
    Fall,
    /// Proximity change.
    Proximity,
    /// Any other (or missing) type.
    Other(Option<String>),
}

impl EventKind {
    fn from_field(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some(t) if t.eq_ignore_ascii_case("fall") => Self::Fall,
            Some(t) if t.eq_ignore_ascii_case("proximity") => Self::Proximity,
            Some(t) => Self::Other(Some(t.to_string())),
            None => Self::Other(None),
        }
    }
}

/// A successfully decoded notification: the payload's top-level fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedEvent {
    fields: Map<String, Value>,
}

impl DecodedEvent {
    /// Wrap an already-parsed JSON object.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// The event's fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up a single field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Classify the event by its `type` field.
    pub fn kind(&self) -> EventKind {
        EventKind::from_field(self.fields.get("type"))
    }

    /// Consume the event, returning its fields.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Decode a notification into an event.
///
/// UTF-8 is checked first, then the text must parse as a JSON object.
pub fn decode(raw: &RawNotification) -> Result<DecodedEvent, DecodeError> {
    decode_bytes(&raw.data)
}

/// Decode a raw byte slice into an event.
pub fn decode_bytes(data: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let text = std::str::from_utf8(data).map_err(DecodeError::encoding)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Ok(DecodedEvent { fields }),
        Ok(other) => Err(DecodeError::json(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(DecodeError::json(e.to_string())),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decode_fall_event() {
        let raw = RawNotification::new(&br#"{"type":"fall","g":3.2}"#[..]);
        let event = decode(&raw).unwrap();

        assert_eq!(event.kind(), EventKind::Fall);
        assert_eq!(event.get("g"), Some(&json!(3.2)));
        assert_eq!(event.fields().len(), 2);
    }

    #[test]
    fn test_kind_classification() {
        let prox = decode_bytes(br#"{"type":"Proximity"}"#).unwrap();
        assert_eq!(prox.kind(), EventKind::Proximity);

        let other = decode_bytes(br#"{"type":"battery"}"#).unwrap();
        assert_eq!(other.kind(), EventKind::Other(Some("battery".to_string())));

        let missing = decode_bytes(br#"{"x":1}"#).unwrap();
        assert_eq!(missing.kind(), EventKind::Other(None));
    }

    #[test]
    fn test_invalid_utf8_is_encoding_error() {
        let err = decode_bytes(&[0x7b, 0xff, 0xfe, 0x7d]).unwrap_err();
        assert_eq!(err.reason, DecodeReason::Encoding);
    }

    #[test]
    fn test_malformed_json_is_json_error() {
        let err = decode_bytes(br#"{"type": fall}"#).unwrap_err();
        assert_eq!(err.reason, DecodeReason::Json);

        let err = decode_bytes(b"").unwrap_err();
        assert_eq!(err.reason, DecodeReason::Json);
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        let err = decode_bytes(b"[1,2,3]").unwrap_err();
        assert_eq!(err.reason, DecodeReason::Json);
        assert!(err.detail.contains("an array"));
    }

    #[test]
    fn test_unknown_shapes_pass_through() {
        let event = decode_bytes(br#"{"nested":{"a":[1,null]},"v":2}"#).unwrap();
        assert_eq!(event.get("nested"), Some(&json!({"a": [1, null]})));
    }

    #[test]
    fn test_text_is_lossy() {
        let raw = RawNotification::new(vec![b'o', b'k', 0xff]);
        assert_eq!(raw.text(), "ok\u{fffd}");
    }

    proptest! {
        #[test]
        fn prop_valid_objects_keep_top_level_keys(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8)
        ) {
            let object: Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let bytes = serde_json::to_vec(&Value::Object(object.clone())).unwrap();

            let event = decode_bytes(&bytes).unwrap();
            prop_assert_eq!(event.fields(), &object);
        }

        #[test]
        fn prop_invalid_utf8_never_decodes(
            prefix in proptest::collection::vec(0u8..0x80, 0..16),
            suffix in proptest::collection::vec(any::<u8>(), 0..16)
        ) {
            let mut bytes = prefix;
            bytes.push(0xff);
            bytes.extend(suffix);

            let err = decode_bytes(&bytes).unwrap_err();
            prop_assert_eq!(err.reason, DecodeReason::Encoding);
        }
    }
}
