//! Utility functions for the ble-fall-gateway crate.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Truncate a string to at most `max_bytes`, on a character boundary.
///
/// An ellipsis is appended when anything was cut.
///
/// # Example
///
/// ```
/// use ble_fall_gateway::utils::truncate_utf8;
///
/// assert_eq!(truncate_utf8("hello world", 5), "hello…");
/// assert_eq!(truncate_utf8("short", 64), "short");
/// ```
pub fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
