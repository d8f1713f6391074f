#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Server timestamp for chat lines and in-game events (RFC 3339, millisecond precision, UTC).
pub fn rfc3339_now() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
