#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{RoomId, SessionId, UserId, Username};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
	Connected,
	Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomAction {
	Created,
	Joined,
	Left,
	Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameAction {
	Started,
}

/// Lifecycle notification carried on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
	User {
		action: UserAction,
		user_id: UserId,
		username: Username,
	},
	Room {
		action: RoomAction,
		room_id: RoomId,
		username: Username,
		/// Population after the change; absent for deletions.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		player_count: Option<u32>,
	},
	/// Lobby chat line; `recipients` are the room members at send time.
	RoomChat {
		room_id: RoomId,
		username: Username,
		text: String,
		created_at: String,
		recipients: Vec<Username>,
	},
	Game {
		action: GameAction,
		room_id: RoomId,
		session_id: SessionId,
		game_url: String,
		players: Vec<Username>,
	},
}

impl LifecycleEvent {
	/// Short label for logs and metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			LifecycleEvent::User {
				action: UserAction::Connected,
				..
			} => "user.connected",
			LifecycleEvent::User {
				action: UserAction::Disconnected,
				..
			} => "user.disconnected",
			LifecycleEvent::Room { action, .. } => match action {
				RoomAction::Created => "room.created",
				RoomAction::Joined => "room.joined",
				RoomAction::Left => "room.left",
				RoomAction::Deleted => "room.deleted",
			},
			LifecycleEvent::RoomChat { .. } => "room.chat",
			LifecycleEvent::Game { .. } => "game.started",
		}
	}
}
