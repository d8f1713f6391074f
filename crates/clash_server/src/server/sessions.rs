#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clash_domain::{
	GameMode, GameOptions, GameSession, GameVisibility, NewGameSession, PlayerMutation, PuzzleId, PuzzleRef, Room,
	SessionId, UpdateOutcome,
};
use parking_lot::Mutex;
use rand::seq::IndexedRandom as _;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SessionStoreError {
	#[error("session store: {0}")]
	Database(String),
	#[error("corrupt session record {id}: {detail}")]
	Corrupt { id: String, detail: String },
}

impl From<sqlx::Error> for SessionStoreError {
	fn from(e: sqlx::Error) -> Self {
		SessionStoreError::Database(e.to_string())
	}
}

/// Persistence collaborator for puzzles and game sessions.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
	/// Uniformly random puzzle from the approved pool, if any.
	async fn sample_eligible_puzzle(&self) -> Result<Option<PuzzleRef>, SessionStoreError>;

	/// Persist a new session with `version = 0`.
	async fn create_game_session(&self, data: NewGameSession) -> Result<GameSession, SessionStoreError>;

	async fn get_game_session(&self, id: &SessionId) -> Result<Option<GameSession>, SessionStoreError>;

	/// Remove a session nobody was sent to. False if it did not exist.
	async fn discard_game_session(&self, id: &SessionId) -> Result<bool, SessionStoreError>;

	/// Apply `mutation` and bump `version` only if the stored version equals `expected_version`.
	async fn update_game_session_players(
		&self,
		id: &SessionId,
		expected_version: u64,
		mutation: PlayerMutation,
	) -> Result<UpdateOutcome, SessionStoreError>;
}

/// In-memory sessions and puzzle pool.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
	puzzles: Mutex<Vec<PuzzleId>>,
	sessions: Mutex<HashMap<SessionId, GameSession>>,
}

impl MemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_approved_puzzle(&self, id: PuzzleId) {
		let mut puzzles = self.puzzles.lock();
		if !puzzles.contains(&id) {
			puzzles.push(id);
		}
	}

	pub fn session_count(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn sessions(&self) -> Vec<GameSession> {
		self.sessions.lock().values().cloned().collect()
	}
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
	async fn sample_eligible_puzzle(&self) -> Result<Option<PuzzleRef>, SessionStoreError> {
		let puzzles = self.puzzles.lock();
		Ok(puzzles
			.choose(&mut rand::rng())
			.map(|id| PuzzleRef { puzzle_id: id.clone() }))
	}

	async fn create_game_session(&self, data: NewGameSession) -> Result<GameSession, SessionStoreError> {
		let session = GameSession::from_new(SessionId::generate(), data);
		self.sessions
			.lock()
			.insert(session.session_id.clone(), session.clone());
		Ok(session)
	}

	async fn get_game_session(&self, id: &SessionId) -> Result<Option<GameSession>, SessionStoreError> {
		Ok(self.sessions.lock().get(id).cloned())
	}

	async fn discard_game_session(&self, id: &SessionId) -> Result<bool, SessionStoreError> {
		Ok(self.sessions.lock().remove(id).is_some())
	}

	async fn update_game_session_players(
		&self,
		id: &SessionId,
		expected_version: u64,
		mutation: PlayerMutation,
	) -> Result<UpdateOutcome, SessionStoreError> {
		let mut sessions = self.sessions.lock();
		let Some(session) = sessions.get_mut(id) else {
			return Ok(UpdateOutcome::NoMatch);
		};
		if session.version != expected_version {
			return Ok(UpdateOutcome::NoMatch);
		}

		let mut players = session.players.clone();
		if !mutation.apply(&mut players) {
			return Ok(UpdateOutcome::NoMatch);
		}
		session.players = players;
		session.version += 1;
		Ok(UpdateOutcome::Updated(session.clone()))
	}
}

/// Settings for sessions started from the lobby.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
	pub game_length: Duration,
	pub url_prefix: String,
	pub mode: GameMode,
	pub visibility: GameVisibility,
}

impl Default for SessionDefaults {
	fn default() -> Self {
		Self {
			game_length: Duration::from_secs(clash_domain::DEFAULT_GAME_LENGTH_SECONDS),
			url_prefix: "/session/".to_string(),
			mode: GameMode::Rated,
			visibility: GameVisibility::Public,
		}
	}
}

/// A session created for a room, plus where its players should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
	pub session: GameSession,
	pub game_url: String,
}

/// Turns a claimed room into a persisted game session.
#[derive(Clone)]
pub struct GameSessionInitiator {
	store: Arc<dyn SessionStore>,
	defaults: SessionDefaults,
}

impl GameSessionInitiator {
	pub fn new(store: Arc<dyn SessionStore>, defaults: SessionDefaults) -> Self {
		Self { store, defaults }
	}

	pub fn store(&self) -> &Arc<dyn SessionStore> {
		&self.store
	}

	pub fn session_url(&self, id: &SessionId) -> String {
		format!("{}{}", self.defaults.url_prefix, id)
	}

	/// `Ok(None)` when no approved puzzle exists; nothing is written in that case.
	pub async fn start(&self, room: &Room, now_ms: i64) -> Result<Option<StartedSession>, SessionStoreError> {
		let Some(puzzle) = self.store.sample_eligible_puzzle().await? else {
			return Ok(None);
		};

		let length_ms = self.defaults.game_length.as_millis() as i64;
		let data = NewGameSession {
			players: room.player_ids(),
			creator_id: room.owner_id.clone(),
			puzzle_id: puzzle.puzzle_id,
			start_time_ms: now_ms,
			end_time_ms: now_ms + length_ms,
			options: GameOptions {
				mode: self.defaults.mode,
				visibility: self.defaults.visibility,
				max_duration_seconds: self.defaults.game_length.as_secs(),
				allowed_languages: Vec::new(),
			},
		};

		let session = self.store.create_game_session(data).await?;
		let game_url = self.session_url(&session.session_id);
		info!(
			room_id = %room.room_id,
			session_id = %session.session_id,
			players = session.players.len(),
			"game session created"
		);

		Ok(Some(StartedSession { session, game_url }))
	}
}
