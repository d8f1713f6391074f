#![forbid(unsafe_code)]

use clash_domain::{Room, RoomId, Username};
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, expect_empty, payload, split_event, validate_chat};

/// Inbound lobby frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyRequest {
	HostRoom,
	JoinRoom { room_id: RoomId },
	LeaveRoom { room_id: RoomId },
	StartGame { room_id: RoomId },
	ChatMessage { room_id: RoomId, text: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RoomPayload {
	room_id: RoomId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChatPayload {
	room_id: RoomId,
	text: String,
}

impl LobbyRequest {
	pub const HOST_ROOM: &'static str = "HOST_ROOM";
	pub const JOIN_ROOM: &'static str = "JOIN_ROOM";
	pub const LEAVE_ROOM: &'static str = "LEAVE_ROOM";
	pub const START_GAME: &'static str = "START_GAME";
	pub const CHAT_MESSAGE: &'static str = "CHAT_MESSAGE";

	/// Parse one text frame.
	pub fn parse(text: &str) -> Result<Self, ProtocolError> {
		let (event, map) = split_event(text)?;

		match event.as_str() {
			Self::HOST_ROOM => {
				expect_empty(&event, &map)?;
				Ok(LobbyRequest::HostRoom)
			}
			Self::JOIN_ROOM => {
				let p: RoomPayload = payload(&event, map)?;
				Ok(LobbyRequest::JoinRoom { room_id: p.room_id })
			}
			Self::LEAVE_ROOM => {
				let p: RoomPayload = payload(&event, map)?;
				Ok(LobbyRequest::LeaveRoom { room_id: p.room_id })
			}
			Self::START_GAME => {
				let p: RoomPayload = payload(&event, map)?;
				Ok(LobbyRequest::StartGame { room_id: p.room_id })
			}
			Self::CHAT_MESSAGE => {
				let p: ChatPayload = payload(&event, map)?;
				validate_chat(&event, &p.text)?;
				Ok(LobbyRequest::ChatMessage {
					room_id: p.room_id,
					text: p.text,
				})
			}
			_ => Err(ProtocolError::UnknownEvent(event)),
		}
	}

	pub fn event_name(&self) -> &'static str {
		match self {
			LobbyRequest::HostRoom => Self::HOST_ROOM,
			LobbyRequest::JoinRoom { .. } => Self::JOIN_ROOM,
			LobbyRequest::LeaveRoom { .. } => Self::LEAVE_ROOM,
			LobbyRequest::StartGame { .. } => Self::START_GAME,
			LobbyRequest::ChatMessage { .. } => Self::CHAT_MESSAGE,
		}
	}
}

/// Lobby listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
	pub room_id: RoomId,
	pub owner_username: Username,
	pub player_count: u32,
	pub max_players: u32,
	pub players: Vec<Username>,
}

impl From<&Room> for RoomSummary {
	fn from(room: &Room) -> Self {
		Self {
			room_id: room.room_id.clone(),
			owner_username: room.owner_username.clone(),
			player_count: room.player_count() as u32,
			max_players: room.max_players,
			players: room.player_usernames(),
		}
	}
}

/// Outbound lobby frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
	tag = "event",
	rename_all = "SCREAMING_SNAKE_CASE",
	rename_all_fields = "camelCase"
)]
pub enum LobbyResponse {
	RoomCreated { room_id: RoomId },
	RoomJoined { room_id: RoomId },
	JoinFailed { room_id: RoomId },
	AlreadyJoined { room_id: RoomId },
	RoomLeft { room_id: RoomId },
	LeaveFailed { room_id: RoomId },
	StartGameFailed { room_id: RoomId, error: String },
	StartGame { game_url: String },
	RoomsUpdate { rooms: Vec<RoomSummary> },
	ChatMessage {
		room_id: RoomId,
		username: Username,
		text: String,
		created_at: String,
	},
	ChatFailed { room_id: RoomId },
	Error { message: String },
}

impl LobbyResponse {
	pub fn error(message: impl Into<String>) -> Self {
		LobbyResponse::Error {
			message: message.into(),
		}
	}
}
