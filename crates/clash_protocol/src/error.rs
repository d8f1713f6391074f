#![forbid(unsafe_code)]

use thiserror::Error;

/// Reasons an inbound frame was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
	#[error("frame too large ({len} bytes, max {max})")]
	FrameTooLarge { len: usize, max: usize },

	#[error("malformed JSON: {0}")]
	Malformed(String),

	#[error("frame must be a JSON object")]
	NotAnObject,

	#[error("missing event discriminator")]
	MissingEvent,

	#[error("unknown event: {0}")]
	UnknownEvent(String),

	#[error("invalid {event} payload: {detail}")]
	InvalidPayload { event: String, detail: String },
}
