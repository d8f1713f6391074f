#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use clash_domain::{GameOptions, GameSession, NewGameSession, PlayerMutation, PuzzleId, PuzzleRef, SessionId, UpdateOutcome, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

use crate::server::sessions::{SessionStore, SessionStoreError};

/// Puzzle status that makes a puzzle eligible for lobby games.
const APPROVED: &str = "approved";

type SessionRow = (String, String, String, String, i64, i64, String, i64);

/// SQL-backed session store (SQLite or Postgres, chosen by URL prefix).
#[derive(Clone)]
pub struct SqlSessionStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlSessionStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Each in-memory SQLite connection is its own database.
			let max = if database_url.contains(":memory:") { 1 } else { 8 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(16)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Write a puzzle row, replacing its status if it exists. The content service owns this table in production.
	pub async fn upsert_puzzle(&self, id: &PuzzleId, status: &str) -> Result<(), SessionStoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO puzzles (id, status) VALUES (?, ?) ON CONFLICT (id) DO UPDATE SET status = excluded.status")
					.bind(id.as_str())
					.bind(status)
					.execute(pool)
					.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO puzzles (id, status) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET status = excluded.status",
				)
					.bind(id.as_str())
					.bind(status)
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}

	pub async fn seed_approved_puzzle(&self, id: &PuzzleId) -> Result<(), SessionStoreError> {
		self.upsert_puzzle(id, APPROVED).await
	}

	async fn fetch_row(&self, id: &SessionId) -> Result<Option<SessionRow>, SessionStoreError> {
		let row = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as::<_, SessionRow>(
					"SELECT id, creator_id, puzzle_id, players, start_time_ms, end_time_ms, options, version \
					FROM game_sessions WHERE id = ?",
				)
				.bind(id.as_str())
				.fetch_optional(pool)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as::<_, SessionRow>(
					"SELECT id, creator_id, puzzle_id, players, start_time_ms, end_time_ms, options, version \
					FROM game_sessions WHERE id = $1",
				)
				.bind(id.as_str())
				.fetch_optional(pool)
				.await?
			}
		};
		Ok(row)
	}
}

fn corrupt(id: &str, detail: impl ToString) -> SessionStoreError {
	SessionStoreError::Corrupt {
		id: id.to_string(),
		detail: detail.to_string(),
	}
}

fn row_to_session(row: SessionRow) -> Result<GameSession, SessionStoreError> {
	let (id, creator_id, puzzle_id, players, start_time_ms, end_time_ms, options, version) = row;

	let players: Vec<UserId> = serde_json::from_str(&players).map_err(|e| corrupt(&id, e))?;
	let options: GameOptions = serde_json::from_str(&options).map_err(|e| corrupt(&id, e))?;

	Ok(GameSession {
		session_id: SessionId::new(id.clone()).map_err(|e| corrupt(&id, e))?,
		players,
		creator_id: UserId::new(creator_id).map_err(|e| corrupt(&id, e))?,
		puzzle_id: PuzzleId::new(puzzle_id).map_err(|e| corrupt(&id, e))?,
		start_time_ms,
		end_time_ms,
		options,
		version: u64::try_from(version).map_err(|e| corrupt(&id, e))?,
	})
}

fn to_json<T: serde::Serialize>(id: &SessionId, value: &T) -> Result<String, SessionStoreError> {
	serde_json::to_string(value).map_err(|e| corrupt(id.as_str(), e))
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
	async fn sample_eligible_puzzle(&self) -> Result<Option<PuzzleRef>, SessionStoreError> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id FROM puzzles WHERE status = ? ORDER BY RANDOM() LIMIT 1")
					.bind(APPROVED)
					.fetch_optional(pool)
					.await?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id FROM puzzles WHERE status = $1 ORDER BY RANDOM() LIMIT 1")
					.bind(APPROVED)
					.fetch_optional(pool)
					.await?
			}
		};

		row.map(|(id,)| {
			PuzzleId::new(id.clone())
				.map(|puzzle_id| PuzzleRef { puzzle_id })
				.map_err(|e| corrupt(&id, e))
		})
		.transpose()
	}

	async fn create_game_session(&self, data: NewGameSession) -> Result<GameSession, SessionStoreError> {
		let session = GameSession::from_new(SessionId::generate(), data);
		let players = to_json(&session.session_id, &session.players)?;
		let options = to_json(&session.session_id, &session.options)?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO game_sessions \
					(id, creator_id, puzzle_id, players, start_time_ms, end_time_ms, options, version) \
					VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
				)
				.bind(session.session_id.as_str())
				.bind(session.creator_id.as_str())
				.bind(session.puzzle_id.as_str())
				.bind(players)
				.bind(session.start_time_ms)
				.bind(session.end_time_ms)
				.bind(options)
				.execute(pool)
				.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO game_sessions \
					(id, creator_id, puzzle_id, players, start_time_ms, end_time_ms, options, version) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, 0)",
				)
				.bind(session.session_id.as_str())
				.bind(session.creator_id.as_str())
				.bind(session.puzzle_id.as_str())
				.bind(players)
				.bind(session.start_time_ms)
				.bind(session.end_time_ms)
				.bind(options)
				.execute(pool)
				.await?;
			}
		}

		Ok(session)
	}

	async fn get_game_session(&self, id: &SessionId) -> Result<Option<GameSession>, SessionStoreError> {
		self.fetch_row(id).await?.map(row_to_session).transpose()
	}

	async fn discard_game_session(&self, id: &SessionId) -> Result<bool, SessionStoreError> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM game_sessions WHERE id = ?")
				.bind(id.as_str())
				.execute(pool)
				.await?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM game_sessions WHERE id = $1")
				.bind(id.as_str())
				.execute(pool)
				.await?
				.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn update_game_session_players(
		&self,
		id: &SessionId,
		expected_version: u64,
		mutation: PlayerMutation,
	) -> Result<UpdateOutcome, SessionStoreError> {
		let Some(row) = self.fetch_row(id).await? else {
			return Ok(UpdateOutcome::NoMatch);
		};
		let mut session = row_to_session(row)?;
		if session.version != expected_version {
			return Ok(UpdateOutcome::NoMatch);
		}
		if !mutation.apply(&mut session.players) {
			return Ok(UpdateOutcome::NoMatch);
		}

		let players = to_json(id, &session.players)?;
		let expected = expected_version as i64;

		// The version predicate makes this a compare-and-swap against concurrent writers.
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE game_sessions SET players = ?, version = version + 1 WHERE id = ? AND version = ?",
			)
			.bind(players)
			.bind(id.as_str())
			.bind(expected)
			.execute(pool)
			.await?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"UPDATE game_sessions SET players = $1, version = version + 1 WHERE id = $2 AND version = $3",
			)
			.bind(players)
			.bind(id.as_str())
			.bind(expected)
			.execute(pool)
			.await?
			.rows_affected(),
		};

		if affected == 0 {
			return Ok(UpdateOutcome::NoMatch);
		}

		session.version = expected_version + 1;
		Ok(UpdateOutcome::Updated(session))
	}
}
