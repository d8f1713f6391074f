#![forbid(unsafe_code)]

//! JSON wire frames for the lobby and in-game WebSocket endpoints.
//!
//! Every frame is a JSON object with a required `event` discriminator. Inbound frames are parsed
//! strictly: unknown events, missing fields and extra fields are all rejected.

pub mod error;
pub mod game;
pub mod lobby;

pub use error::ProtocolError;
pub use game::{GameRequest, GameResponse};
pub use lobby::{LobbyRequest, LobbyResponse, RoomSummary};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Default upper bound for a single inbound text frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Chat messages are limited to this many characters.
pub const MAX_CHAT_CHARS: usize = 500;

/// Reject frames larger than `max` bytes.
pub fn check_frame_len(len: usize, max: usize) -> Result<(), ProtocolError> {
	if len > max {
		return Err(ProtocolError::FrameTooLarge { len, max });
	}
	Ok(())
}

/// Split a frame into its `event` name and the remaining payload fields.
pub(crate) fn split_event(text: &str) -> Result<(String, Map<String, Value>), ProtocolError> {
	let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
	let Value::Object(mut map) = value else {
		return Err(ProtocolError::NotAnObject);
	};

	match map.remove("event") {
		Some(Value::String(event)) => Ok((event, map)),
		Some(_) => Err(ProtocolError::InvalidPayload {
			event: String::new(),
			detail: "event must be a string".into(),
		}),
		None => Err(ProtocolError::MissingEvent),
	}
}

/// Deserialize the payload fields of `event` into `T`.
pub(crate) fn payload<T: DeserializeOwned>(event: &str, map: Map<String, Value>) -> Result<T, ProtocolError> {
	serde_json::from_value(Value::Object(map)).map_err(|e| ProtocolError::InvalidPayload {
		event: event.to_string(),
		detail: e.to_string(),
	})
}

/// Events without payload must not carry any other field.
pub(crate) fn expect_empty(event: &str, map: &Map<String, Value>) -> Result<(), ProtocolError> {
	if let Some(key) = map.keys().next() {
		return Err(ProtocolError::InvalidPayload {
			event: event.to_string(),
			detail: format!("unexpected field `{key}`"),
		});
	}
	Ok(())
}

/// Validate chat text length (in characters, after trimming).
pub(crate) fn validate_chat(event: &str, text: &str) -> Result<(), ProtocolError> {
	let len = text.trim().chars().count();
	if len == 0 || text.chars().count() > MAX_CHAT_CHARS {
		return Err(ProtocolError::InvalidPayload {
			event: event.to_string(),
			detail: format!("message must be 1..={MAX_CHAT_CHARS} characters"),
		});
	}
	Ok(())
}
