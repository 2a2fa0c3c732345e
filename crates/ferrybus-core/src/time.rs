//! Timing utilities

use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp type (milliseconds since the Unix epoch)
pub type Timestamp = u64;

/// Current Unix timestamp in milliseconds
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}
