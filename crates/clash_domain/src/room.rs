#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{Identity, RoomId, UserId, Username};

/// One seat in a room, in join order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
	pub user_id: UserId,
	pub username: Username,
}

impl From<&Identity> for RoomMember {
	fn from(identity: &Identity) -> Self {
		Self {
			user_id: identity.user_id.clone(),
			username: identity.username.clone(),
		}
	}
}

/// Start-transition phase stored on the room record.
///
/// A freshly hosted room (one member) and a room with several members are both `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
	#[default]
	Open,
	Starting,
}

/// Pre-game lobby room as stored in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
	pub room_id: RoomId,
	pub owner_id: UserId,
	pub owner_username: Username,
	pub players: Vec<RoomMember>,
	pub created_at_ms: i64,
	pub max_players: u32,
	#[serde(default)]
	pub phase: RoomPhase,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub starting_since_ms: Option<i64>,
	/// Identifies the caller holding the `starting` claim.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start_token: Option<String>,
}

impl Room {
	/// New room whose only member is the host.
	pub fn new(room_id: RoomId, host: &Identity, max_players: u32, now_ms: i64) -> Self {
		Self {
			room_id,
			owner_id: host.user_id.clone(),
			owner_username: host.username.clone(),
			players: vec![RoomMember::from(host)],
			created_at_ms: now_ms,
			max_players,
			phase: RoomPhase::Open,
			starting_since_ms: None,
			start_token: None,
		}
	}

	pub fn player_count(&self) -> usize {
		self.players.len()
	}

	pub fn contains(&self, user_id: &UserId) -> bool {
		self.players.iter().any(|p| &p.user_id == user_id)
	}

	pub fn is_full(&self) -> bool {
		self.players.len() >= self.max_players as usize
	}

	pub fn player_ids(&self) -> Vec<UserId> {
		self.players.iter().map(|p| p.user_id.clone()).collect()
	}

	pub fn player_usernames(&self) -> Vec<Username> {
		self.players.iter().map(|p| p.username.clone()).collect()
	}

	/// Whether a start claim is held and younger than `lease_ms`.
	pub fn start_in_progress(&self, now_ms: i64, lease_ms: i64) -> bool {
		match (self.phase, self.starting_since_ms) {
			(RoomPhase::Starting, Some(since)) => now_ms.saturating_sub(since) < lease_ms,
			(RoomPhase::Starting, None) => true,
			(RoomPhase::Open, _) => false,
		}
	}

	pub fn holds_start_claim(&self, token: &str) -> bool {
		self.phase == RoomPhase::Starting && self.start_token.as_deref() == Some(token)
	}

	/// Drop any `starting` claim and return to `open`.
	pub fn clear_start_claim(&mut self) {
		self.phase = RoomPhase::Open;
		self.starting_since_ms = None;
		self.start_token = None;
	}
}

/// Process-wide record of a connected user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
	pub username: Username,
	pub user_id: UserId,
	pub connection_id: String,
	/// Process the connection is attached to.
	pub server_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	pub last_seen_ms: i64,
}
