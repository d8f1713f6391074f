#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use clash_domain::{
	GameAction, Identity, LifecycleEvent, Room, RoomAction, RoomId, RoomMember, SessionId, UserAction, UserPresence,
	Username,
};
use clash_protocol::RoomSummary;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::server::bus::{BusEnvelope, BusError, EventBus};
use crate::server::sessions::{GameSessionInitiator, SessionStoreError};
use crate::server::store::{CoordinationStore, JoinResult, LeaveResult, StartClaim, StoreError};
use crate::util::time::{rfc3339_now, unix_ms_now};

#[derive(Debug, Error)]
pub enum RoomError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Session(#[from] SessionStoreError),
	#[error(transparent)]
	Bus(#[from] BusError),
	#[error("room {0} is starting a game")]
	Starting(RoomId),
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
	pub max_players: u32,
	/// A `starting` claim older than this is treated as abandoned.
	pub start_lease: Duration,
}

impl Default for RoomConfig {
	fn default() -> Self {
		Self {
			max_players: 8,
			start_lease: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
	Joined { player_count: usize },
	AlreadyJoined,
	NotFound,
	Full,
	Starting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
	Left { player_count: usize },
	Deleted,
	NotFound,
	/// The room is mid-start; its players are committed to the game.
	Starting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
	Started { session_id: SessionId, game_url: String },
	/// No eligible puzzle; the room is back to `open`.
	Unavailable,
	InProgress,
	NotFound,
	NotMember,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
	Sent,
	NotFound,
	NotMember,
}

/// Room state machine over the shared coordination store.
///
/// Every state change is published on the event bus so that other processes refresh their lobbies.
/// Publishing is best effort: once the store write has committed, a bus failure is logged and the
/// operation still reports success.
#[derive(Clone)]
pub struct RoomManager {
	store: Arc<dyn CoordinationStore>,
	bus: Arc<dyn EventBus>,
	initiator: GameSessionInitiator,
	server_id: String,
	cfg: RoomConfig,
}

impl RoomManager {
	pub fn new(
		store: Arc<dyn CoordinationStore>,
		bus: Arc<dyn EventBus>,
		initiator: GameSessionInitiator,
		server_id: impl Into<String>,
		cfg: RoomConfig,
	) -> Self {
		Self {
			store,
			bus,
			initiator,
			server_id: server_id.into(),
			cfg,
		}
	}

	pub fn store(&self) -> &Arc<dyn CoordinationStore> {
		&self.store
	}

	/// Record presence for a freshly authenticated lobby socket.
	pub async fn connect(&self, identity: &Identity, connection_id: &str) -> Result<(), RoomError> {
		// A reconnect keeps the room the user was in.
		let room_id = self
			.store
			.get_presence(&identity.username)
			.await?
			.and_then(|p| p.room_id);

		let presence = UserPresence {
			username: identity.username.clone(),
			user_id: identity.user_id.clone(),
			connection_id: connection_id.to_string(),
			server_id: self.server_id.clone(),
			room_id,
			last_seen_ms: unix_ms_now(),
		};
		self.store.set_presence(&presence).await?;

		self.publish(LifecycleEvent::User {
			action: UserAction::Connected,
			user_id: identity.user_id.clone(),
			username: identity.username.clone(),
		})
		.await;
		Ok(())
	}

	/// Tear down presence and room membership for a closed socket.
	///
	/// Does nothing when a newer connection already owns the presence entry.
	pub async fn disconnect(&self, username: &Username, connection_id: &str) -> Result<(), RoomError> {
		let Some(presence) = self.store.get_presence(username).await? else {
			return Ok(());
		};
		if presence.connection_id != connection_id {
			debug!(%username, conn = connection_id, "disconnect of superseded connection; keeping presence");
			return Ok(());
		}

		let identity = Identity::new(presence.user_id, presence.username);
		if let Some(room_id) = presence.room_id {
			self.remove_member(&identity, &room_id).await?;
		}
		self.store.delete_presence(username, connection_id).await?;

		self.publish(LifecycleEvent::User {
			action: UserAction::Disconnected,
			user_id: identity.user_id,
			username: identity.username,
		})
		.await;
		Ok(())
	}

	/// Heartbeat refresh; false when the presence entry already expired.
	pub async fn touch(&self, username: &Username) -> Result<bool, RoomError> {
		Ok(self.store.touch_presence(username, unix_ms_now()).await?)
	}

	pub async fn host_room(&self, identity: &Identity) -> Result<RoomId, RoomError> {
		if let Some(starting) = self.leave_current_room(identity, None).await? {
			return Err(RoomError::Starting(starting));
		}

		let room = Room::new(RoomId::generate(), identity, self.cfg.max_players, unix_ms_now());
		self.store.set_room(&room).await?;
		self.store
			.set_presence_room(&identity.username, Some(&room.room_id))
			.await?;

		metrics::counter!("clash_rooms_created_total").increment(1);
		info!(room_id = %room.room_id, owner = %identity, "room created");

		self.publish(LifecycleEvent::Room {
			action: RoomAction::Created,
			room_id: room.room_id.clone(),
			username: identity.username.clone(),
			player_count: Some(1),
		})
		.await;
		Ok(room.room_id)
	}

	pub async fn join_room(&self, identity: &Identity, room_id: &RoomId) -> Result<JoinOutcome, RoomError> {
		let member = RoomMember::from(identity);
		let room = match self.store.add_player(room_id, &member).await? {
			JoinResult::Joined(room) => room,
			JoinResult::AlreadyJoined => return Ok(JoinOutcome::AlreadyJoined),
			JoinResult::NotFound => return Ok(JoinOutcome::NotFound),
			JoinResult::Full => return Ok(JoinOutcome::Full),
			JoinResult::Starting => return Ok(JoinOutcome::Starting),
		};

		if self.leave_current_room(identity, Some(room_id)).await?.is_some() {
			// Still committed to a game elsewhere; undo the unannounced join.
			self.store
				.remove_player(room_id, &identity.user_id, unix_ms_now(), self.lease_ms())
				.await?;
			return Ok(JoinOutcome::Starting);
		}
		self.store.set_presence_room(&identity.username, Some(room_id)).await?;

		let player_count = room.player_count();
		debug!(%room_id, user = %identity, player_count, "room joined");

		self.publish(LifecycleEvent::Room {
			action: RoomAction::Joined,
			room_id: room_id.clone(),
			username: identity.username.clone(),
			player_count: Some(player_count as u32),
		})
		.await;
		Ok(JoinOutcome::Joined { player_count })
	}

	pub async fn leave_room(&self, identity: &Identity, room_id: &RoomId) -> Result<LeaveOutcome, RoomError> {
		let outcome = self.remove_member(identity, room_id).await?;
		if matches!(outcome, LeaveOutcome::Left { .. } | LeaveOutcome::Deleted) {
			self.clear_presence_room(&identity.username, room_id).await?;
		}
		Ok(outcome)
	}

	/// The `open -> starting -> started` transition.
	///
	/// Exactly one caller holds the claim at a time, and the player set is frozen while it does. The room
	/// is removed and `game.started` published only if the claim is still this caller's at the end.
	pub async fn start_game(&self, identity: &Identity, room_id: &RoomId) -> Result<StartOutcome, RoomError> {
		match self.store.get_room(room_id).await? {
			None => return Ok(StartOutcome::NotFound),
			Some(room) if !room.contains(&identity.user_id) => return Ok(StartOutcome::NotMember),
			Some(_) => {}
		}

		let token = uuid::Uuid::new_v4().simple().to_string();
		let room = match self
			.store
			.claim_start(room_id, &token, unix_ms_now(), self.lease_ms())
			.await?
		{
			StartClaim::Claimed(room) => room,
			StartClaim::InProgress => return Ok(StartOutcome::InProgress),
			StartClaim::NotFound => return Ok(StartOutcome::NotFound),
		};

		// Membership may have changed between the check and the claim.
		if !room.contains(&identity.user_id) {
			self.store.release_start(room_id, &token).await?;
			return Ok(StartOutcome::NotMember);
		}

		let started = match self.initiator.start(&room, unix_ms_now()).await {
			Ok(Some(started)) => started,
			Ok(None) => {
				self.store.release_start(room_id, &token).await?;
				info!(%room_id, "start requested but no approved puzzle is available");
				return Ok(StartOutcome::Unavailable);
			}
			Err(e) => {
				if let Err(release_err) = self.store.release_start(room_id, &token).await {
					warn!(%room_id, error = %release_err, "failed to release start claim; it will expire with the lease");
				}
				return Err(e.into());
			}
		};
		let session_id = started.session.session_id.clone();

		let room = match self.store.finish_start(room_id, &token).await {
			Ok(Some(room)) => room,
			Ok(None) => {
				metrics::counter!("clash_start_claims_lost_total").increment(1);
				warn!(%room_id, %session_id, "start claim expired before the session was announced; discarding it");
				if let Err(e) = self.initiator.store().discard_game_session(&session_id).await {
					warn!(%room_id, %session_id, error = %e, "failed to discard unannounced session");
				}
				return Ok(StartOutcome::InProgress);
			}
			Err(e) => {
				// The session is committed; players must still be sent to it.
				warn!(%room_id, %session_id, error = %e, "failed to remove started room; it lingers until its lease expires");
				room
			}
		};

		for member in &room.players {
			if let Err(e) = self.clear_presence_room(&member.username, room_id).await {
				warn!(%room_id, username = %member.username, error = %e, "failed to clear presence room after start");
			}
		}

		metrics::counter!("clash_games_started_total").increment(1);
		info!(%room_id, %session_id, players = room.player_count(), "game started");

		self.publish(LifecycleEvent::Game {
			action: GameAction::Started,
			room_id: room_id.clone(),
			session_id: session_id.clone(),
			game_url: started.game_url.clone(),
			players: room.player_usernames(),
		})
		.await;

		Ok(StartOutcome::Started {
			session_id,
			game_url: started.game_url,
		})
	}

	/// Relay a lobby chat line to every member of the room, on whichever process they live.
	pub async fn chat(&self, identity: &Identity, room_id: &RoomId, text: &str) -> Result<ChatOutcome, RoomError> {
		let Some(room) = self.store.get_room(room_id).await? else {
			return Ok(ChatOutcome::NotFound);
		};
		if !room.contains(&identity.user_id) {
			return Ok(ChatOutcome::NotMember);
		}

		let event = LifecycleEvent::RoomChat {
			room_id: room_id.clone(),
			username: identity.username.clone(),
			text: text.to_string(),
			created_at: rfc3339_now(),
			recipients: room.player_usernames(),
		};
		self.bus
			.publish(BusEnvelope {
				origin: self.server_id.clone(),
				event,
			})
			.await?;
		Ok(ChatOutcome::Sent)
	}

	pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, RoomError> {
		let rooms = self.store.list_rooms().await?;
		Ok(rooms.iter().map(RoomSummary::from).collect())
	}

	/// Remove members whose presence expired. Returns how many were removed.
	pub async fn reap_stale_members(&self) -> Result<usize, RoomError> {
		let mut removed = 0;
		for room in self.store.list_rooms().await? {
			for member in &room.players {
				if self.store.get_presence(&member.username).await?.is_some() {
					continue;
				}
				let identity = Identity::new(member.user_id.clone(), member.username.clone());
				let outcome = self.remove_member(&identity, &room.room_id).await?;
				if matches!(outcome, LeaveOutcome::Left { .. } | LeaveOutcome::Deleted) {
					debug!(room_id = %room.room_id, username = %member.username, "reaped member with expired presence");
					removed += 1;
				}
			}
		}
		Ok(removed)
	}

	/// Leave whatever room presence points at, unless it is `keep`.
	///
	/// Returns the previous room when it is mid-start and could not be left.
	async fn leave_current_room(&self, identity: &Identity, keep: Option<&RoomId>) -> Result<Option<RoomId>, RoomError> {
		let Some(previous) = self
			.store
			.get_presence(&identity.username)
			.await?
			.and_then(|p| p.room_id)
		else {
			return Ok(None);
		};
		if Some(&previous) == keep {
			return Ok(None);
		}

		debug!(user = %identity, room_id = %previous, "leaving previous room");
		match self.remove_member(identity, &previous).await? {
			LeaveOutcome::Starting => Ok(Some(previous)),
			_ => Ok(None),
		}
	}

	async fn remove_member(&self, identity: &Identity, room_id: &RoomId) -> Result<LeaveOutcome, RoomError> {
		let removed = self
			.store
			.remove_player(room_id, &identity.user_id, unix_ms_now(), self.lease_ms())
			.await?;
		let (outcome, event) = match removed {
			LeaveResult::Left(room) => {
				let player_count = room.player_count();
				(
					LeaveOutcome::Left { player_count },
					LifecycleEvent::Room {
						action: RoomAction::Left,
						room_id: room_id.clone(),
						username: identity.username.clone(),
						player_count: Some(player_count as u32),
					},
				)
			}
			LeaveResult::Deleted => {
				info!(%room_id, "room deleted (last player left)");
				(
					LeaveOutcome::Deleted,
					LifecycleEvent::Room {
						action: RoomAction::Deleted,
						room_id: room_id.clone(),
						username: identity.username.clone(),
						player_count: None,
					},
				)
			}
			LeaveResult::NotMember | LeaveResult::NotFound => return Ok(LeaveOutcome::NotFound),
			LeaveResult::Starting => {
				debug!(%room_id, user = %identity, "leave refused while the room is starting");
				return Ok(LeaveOutcome::Starting);
			}
		};

		self.publish(event).await;
		Ok(outcome)
	}

	fn lease_ms(&self) -> i64 {
		self.cfg.start_lease.as_millis() as i64
	}

	async fn clear_presence_room(&self, username: &Username, room_id: &RoomId) -> Result<(), RoomError> {
		let points_here = self
			.store
			.get_presence(username)
			.await?
			.is_some_and(|p| p.room_id.as_ref() == Some(room_id));
		if points_here {
			self.store.set_presence_room(username, None).await?;
		}
		Ok(())
	}

	async fn publish(&self, event: LifecycleEvent) {
		let kind = event.kind();
		let envelope = BusEnvelope {
			origin: self.server_id.clone(),
			event,
		};
		if let Err(e) = self.bus.publish(envelope).await {
			metrics::counter!("clash_bus_publish_failures_total").increment(1);
			warn!(kind, error = %e, "failed to publish lifecycle event");
		}
	}
}
