#![forbid(unsafe_code)]

use std::sync::Arc;

use clash_domain::{GameSession, Identity, PlayerMutation, SessionId, UpdateOutcome};
use clash_protocol::{GameRequest, GameResponse};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::registry::Outbound;
use crate::server::session_hub::SessionHub;
use crate::server::sessions::{SessionStore, SessionStoreError};
use crate::util::time::{rfc3339_now, unix_ms_now};

/// One authenticated socket on `/ws/session/{id}`.
#[derive(Debug, Clone)]
pub struct GamePeer {
	pub identity: Identity,
	pub session_id: SessionId,
	pub connection_id: String,
}

/// Whether the socket stays open after the initial handshake frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
	Attached,
	Rejected,
}

/// In-game relay: late joins under optimistic concurrency plus fan-out of player activity.
#[derive(Clone)]
pub struct GameChannel {
	sessions: Arc<dyn SessionStore>,
	hub: SessionHub,
}

impl GameChannel {
	pub fn new(sessions: Arc<dyn SessionStore>, hub: SessionHub) -> Self {
		Self { sessions, hub }
	}

	pub fn hub(&self) -> &SessionHub {
		&self.hub
	}

	/// Send the initial frames and subscribe the peer to its session.
	pub async fn on_connect(&self, peer: &GamePeer, tx: mpsc::Sender<Outbound>) -> Result<Attach, SessionStoreError> {
		let Some(session) = self.sessions.get_game_session(&peer.session_id).await? else {
			queue(&tx, &nonexistent(&peer.session_id));
			let _ = tx.try_send(Outbound::Close {
				code: 1000,
				reason: "Game not found".to_string(),
			});
			return Ok(Attach::Rejected);
		};

		queue(&tx, &overview_for(&session));
		if !session.is_finished(unix_ms_now()) && !session.has_player(&peer.identity.user_id) {
			queue(&tx, &not_joined(peer));
		}

		self.hub
			.join(&peer.session_id, peer.identity.username.clone(), &peer.connection_id, tx)
			.await;
		debug!(session = %peer.session_id, user = %peer.identity, "game channel: attached");
		Ok(Attach::Attached)
	}

	pub async fn on_disconnect(&self, peer: &GamePeer) {
		self.hub
			.leave(&peer.session_id, &peer.identity.username, &peer.connection_id)
			.await;
	}

	/// Parse and handle one inbound frame; errors become `ERROR` frames to the sender.
	pub async fn handle_text(&self, peer: &GamePeer, text: &str) {
		let req = match GameRequest::parse(text) {
			Ok(r) => r,
			Err(e) => {
				debug!(session = %peer.session_id, error = %e, "game channel: rejected frame");
				self.reply(peer, &GameResponse::error(e.to_string())).await;
				return;
			}
		};

		if let Err(e) = self.handle(peer, req).await {
			warn!(session = %peer.session_id, user = %peer.identity, error = %e, "game channel: request failed");
			self.reply(peer, &GameResponse::error("Internal error")).await;
		}
	}

	pub async fn handle(&self, peer: &GamePeer, req: GameRequest) -> Result<(), SessionStoreError> {
		let Some(session) = self.sessions.get_game_session(&peer.session_id).await? else {
			self.reply(peer, &nonexistent(&peer.session_id)).await;
			return Ok(());
		};

		if session.is_finished(unix_ms_now()) {
			self.reply(peer, &GameResponse::FinishedGame { session }).await;
			return Ok(());
		}

		let identity = &peer.identity;
		match req {
			GameRequest::JoinGame { version } => return self.join(peer, session, version).await,
			_ if !session.has_player(&identity.user_id) => {
				self.reply(peer, &not_joined(peer)).await;
			}
			GameRequest::CodeUpdate { code, language } => {
				let frame = GameResponse::PlayerCodeUpdated {
					user_id: identity.user_id.clone(),
					username: identity.username.clone(),
					code,
					language,
					timestamp: rfc3339_now(),
				};
				self.hub.broadcast(&peer.session_id, &frame).await;
			}
			GameRequest::SubmissionResult {
				status,
				execution_time,
				submission_id,
			} => {
				let frame = GameResponse::PlayerSubmitted {
					user_id: identity.user_id.clone(),
					username: identity.username.clone(),
					status,
					execution_time,
					submission_id,
					timestamp: rfc3339_now(),
				};
				self.hub.broadcast(&peer.session_id, &frame).await;
			}
			GameRequest::ChatMessage { message } => {
				let frame = GameResponse::ChatMessage {
					username: identity.username.clone(),
					message,
					created_at: rfc3339_now(),
				};
				self.hub.broadcast(&peer.session_id, &frame).await;
			}
			GameRequest::ChangeLanguage { language } => {
				let frame = GameResponse::LanguageChanged {
					username: identity.username.clone(),
					language,
				};
				self.hub.broadcast(&peer.session_id, &frame).await;
			}
		}
		Ok(())
	}

	async fn join(&self, peer: &GamePeer, session: GameSession, version: u64) -> Result<(), SessionStoreError> {
		if session.has_player(&peer.identity.user_id) {
			self.reply(peer, &GameResponse::GameOverview { session }).await;
			return Ok(());
		}

		let mutation = PlayerMutation::Add(peer.identity.user_id.clone());
		match self
			.sessions
			.update_game_session_players(&peer.session_id, version, mutation)
			.await?
		{
			UpdateOutcome::Updated(session) => {
				info!(session = %peer.session_id, user = %peer.identity, version = session.version, "player joined game");
				self.hub
					.broadcast(&peer.session_id, &GameResponse::GameOverview { session })
					.await;
			}
			UpdateOutcome::NoMatch => {
				// Re-read so the client can retry against the version that won.
				let current = self.sessions.get_game_session(&peer.session_id).await?;
				let frame = match current {
					Some(s) if s.has_player(&peer.identity.user_id) => GameResponse::GameOverview { session: s },
					Some(s) => GameResponse::JoinGameFailed {
						message: "Game was updated; retry with the latest version".to_string(),
						version: s.version,
					},
					None => nonexistent(&peer.session_id),
				};
				self.reply(peer, &frame).await;
			}
		}
		Ok(())
	}

	async fn reply(&self, peer: &GamePeer, frame: &GameResponse) {
		self.hub
			.send_to(&peer.session_id, &peer.identity.username, frame)
			.await;
	}
}

fn overview_for(session: &GameSession) -> GameResponse {
	if session.is_finished(unix_ms_now()) {
		GameResponse::FinishedGame {
			session: session.clone(),
		}
	} else {
		GameResponse::GameOverview {
			session: session.clone(),
		}
	}
}

fn nonexistent(id: &SessionId) -> GameResponse {
	GameResponse::NonexistentGame {
		message: format!("game {id} does not exist"),
	}
}

fn not_joined(peer: &GamePeer) -> GameResponse {
	GameResponse::error(format!("user {} didn't join game", peer.identity.username))
}

fn queue(tx: &mpsc::Sender<Outbound>, frame: &GameResponse) {
	match serde_json::to_string(frame) {
		Ok(text) => {
			let _ = tx.try_send(Outbound::Text(text));
		}
		Err(e) => warn!(error = %e, "game channel: failed to encode frame"),
	}
}
