#![forbid(unsafe_code)]

use clash_domain::{GameSession, UserId, Username};
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, payload, split_event, validate_chat};

/// Inbound frame on a live game session socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameRequest {
	/// Late join; `version` is the last session version the client saw.
	JoinGame { version: u64 },
	CodeUpdate { code: String, language: String },
	SubmissionResult {
		status: String,
		execution_time: Option<u64>,
		submission_id: Option<String>,
	},
	ChatMessage { message: String },
	ChangeLanguage { language: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JoinPayload {
	version: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CodePayload {
	code: String,
	language: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubmissionPayload {
	status: String,
	#[serde(default)]
	execution_time: Option<u64>,
	#[serde(default)]
	submission_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChatPayload {
	message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LanguagePayload {
	language: String,
}

impl GameRequest {
	pub fn parse(text: &str) -> Result<Self, ProtocolError> {
		let (event, map) = split_event(text)?;

		match event.as_str() {
			"JOIN_GAME" => {
				let p: JoinPayload = payload(&event, map)?;
				Ok(GameRequest::JoinGame { version: p.version })
			}
			"CODE_UPDATE" => {
				let p: CodePayload = payload(&event, map)?;
				Ok(GameRequest::CodeUpdate {
					code: p.code,
					language: p.language,
				})
			}
			"SUBMISSION_RESULT" => {
				let p: SubmissionPayload = payload(&event, map)?;
				if p.status.trim().is_empty() {
					return Err(ProtocolError::InvalidPayload {
						event,
						detail: "status must be non-empty".into(),
					});
				}
				Ok(GameRequest::SubmissionResult {
					status: p.status,
					execution_time: p.execution_time,
					submission_id: p.submission_id,
				})
			}
			"CHAT_MESSAGE" => {
				let p: ChatPayload = payload(&event, map)?;
				validate_chat(&event, &p.message)?;
				Ok(GameRequest::ChatMessage { message: p.message })
			}
			"CHANGE_LANGUAGE" => {
				let p: LanguagePayload = payload(&event, map)?;
				if p.language.trim().is_empty() {
					return Err(ProtocolError::InvalidPayload {
						event,
						detail: "language must be non-empty".into(),
					});
				}
				Ok(GameRequest::ChangeLanguage { language: p.language })
			}
			_ => Err(ProtocolError::UnknownEvent(event)),
		}
	}
}

/// Outbound frame on a live game session socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
	tag = "event",
	rename_all = "SCREAMING_SNAKE_CASE",
	rename_all_fields = "camelCase"
)]
pub enum GameResponse {
	GameOverview {
		session: GameSession,
	},
	FinishedGame {
		session: GameSession,
	},
	NonexistentGame {
		message: String,
	},
	JoinGameFailed {
		message: String,
		version: u64,
	},
	PlayerCodeUpdated {
		user_id: UserId,
		username: Username,
		code: String,
		language: String,
		timestamp: String,
	},
	PlayerSubmitted {
		user_id: UserId,
		username: Username,
		status: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		execution_time: Option<u64>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		submission_id: Option<String>,
		timestamp: String,
	},
	ChatMessage {
		username: Username,
		message: String,
		created_at: String,
	},
	LanguageChanged {
		username: Username,
		language: String,
	},
	Error {
		message: String,
	},
}

impl GameResponse {
	pub fn error(message: impl Into<String>) -> Self {
		GameResponse::Error {
			message: message.into(),
		}
	}
}
