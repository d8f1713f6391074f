#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{PuzzleId, SessionId, UserId};

/// Default length of a lobby-started game.
pub const DEFAULT_GAME_LENGTH_SECONDS: u64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
	#[default]
	Rated,
	Fastest,
	Shortest,
	Backwards,
	Hardcore,
	Debug,
	Typeracer,
	Efficiency,
	Incremental,
	Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameVisibility {
	#[default]
	Public,
	Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOptions {
	pub mode: GameMode,
	pub visibility: GameVisibility,
	pub max_duration_seconds: u64,
	/// Empty means every language is allowed.
	#[serde(default)]
	pub allowed_languages: Vec<String>,
}

impl Default for GameOptions {
	fn default() -> Self {
		Self {
			mode: GameMode::default(),
			visibility: GameVisibility::default(),
			max_duration_seconds: DEFAULT_GAME_LENGTH_SECONDS,
			allowed_languages: Vec::new(),
		}
	}
}

/// Reference to a puzzle eligible for play.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PuzzleRef {
	pub puzzle_id: PuzzleId,
}

/// Data needed to persist a new session; the store assigns the id and `version = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGameSession {
	pub players: Vec<UserId>,
	pub creator_id: UserId,
	pub puzzle_id: PuzzleId,
	pub start_time_ms: i64,
	pub end_time_ms: i64,
	pub options: GameOptions,
}

/// Persisted game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
	pub session_id: SessionId,
	pub players: Vec<UserId>,
	pub creator_id: UserId,
	pub puzzle_id: PuzzleId,
	pub start_time_ms: i64,
	pub end_time_ms: i64,
	pub options: GameOptions,
	/// Optimistic-concurrency token for player-list mutation.
	pub version: u64,
}

impl GameSession {
	pub fn from_new(session_id: SessionId, data: NewGameSession) -> Self {
		Self {
			session_id,
			players: data.players,
			creator_id: data.creator_id,
			puzzle_id: data.puzzle_id,
			start_time_ms: data.start_time_ms,
			end_time_ms: data.end_time_ms,
			options: data.options,
			version: 0,
		}
	}

	pub fn has_player(&self, user_id: &UserId) -> bool {
		self.players.iter().any(|p| p == user_id)
	}

	pub fn is_finished(&self, now_ms: i64) -> bool {
		now_ms >= self.end_time_ms
	}
}

/// Player-list change applied under a version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerMutation {
	Add(UserId),
	Remove(UserId),
}

impl PlayerMutation {
	/// Apply to `players`; returns false when the mutation would be a no-op.
	pub fn apply(&self, players: &mut Vec<UserId>) -> bool {
		match self {
			PlayerMutation::Add(id) => {
				if players.contains(id) {
					return false;
				}
				players.push(id.clone());
				true
			}
			PlayerMutation::Remove(id) => {
				let before = players.len();
				players.retain(|p| p != id);
				players.len() != before
			}
		}
	}
}

/// Result of a versioned player-list mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
	Updated(GameSession),
	/// Unknown session, stale version, or a no-op mutation. Nothing was written.
	NoMatch,
}
