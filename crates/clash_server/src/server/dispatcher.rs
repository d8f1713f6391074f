#![forbid(unsafe_code)]

use std::sync::Arc;

use clash_domain::{Identity, RoomId, Username};
use clash_protocol::{LobbyRequest, LobbyResponse};
use tracing::{debug, warn};

use crate::server::registry::{ConnectionHandle, ConnectionRegistry, DeadConnection};
use crate::server::rooms::{ChatOutcome, JoinOutcome, LeaveOutcome, RoomError, RoomManager, StartOutcome};

pub const NO_PUZZLES: &str = "No approved puzzles available. Create and approve puzzles to play games.";
pub const ALREADY_STARTING: &str = "Game is already starting";
pub const ROOM_NOT_FOUND: &str = "Room not found";
pub const NOT_IN_ROOM: &str = "You are not in this room";
pub const START_FAILED: &str = "Could not start game";

/// Routes lobby frames to the room manager and replies through the local registry.
#[derive(Clone)]
pub struct Dispatcher {
	rooms: RoomManager,
	registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
	pub fn new(rooms: RoomManager, registry: Arc<ConnectionRegistry>) -> Self {
		Self { rooms, registry }
	}

	pub fn rooms(&self) -> &RoomManager {
		&self.rooms
	}

	pub fn registry(&self) -> &Arc<ConnectionRegistry> {
		&self.registry
	}

	/// Register the socket, record presence and send the initial lobby snapshot.
	pub async fn on_connect(&self, identity: &Identity, handle: ConnectionHandle) -> Result<(), RoomError> {
		let connection_id = handle.connection_id().to_string();
		self.registry.register(identity.username.clone(), handle);

		if let Err(e) = self.rooms.connect(identity, &connection_id).await {
			self.registry.unregister(&identity.username, &connection_id);
			return Err(e);
		}

		self.send_rooms_snapshot(&identity.username).await;
		Ok(())
	}

	/// Socket closed. Cleanup runs only if this connection was still the registered one.
	pub async fn on_disconnect(&self, username: &Username, connection_id: &str) {
		if self.registry.unregister(username, connection_id) {
			self.cleanup(username, connection_id).await;
		}
	}

	/// A send found the socket's writer gone; the registry already dropped it.
	pub async fn on_dead_connection(&self, dead: DeadConnection) {
		self.cleanup(&dead.username, &dead.connection_id).await;
	}

	async fn cleanup(&self, username: &Username, connection_id: &str) {
		match self.rooms.disconnect(username, connection_id).await {
			Ok(()) => self.broadcast_rooms().await,
			Err(e) => warn!(%username, conn = connection_id, error = %e, "disconnect cleanup failed"),
		}
	}

	/// Parse and dispatch one text frame. Malformed input is answered with `ERROR`.
	pub async fn handle_text(&self, identity: &Identity, text: &str) {
		match LobbyRequest::parse(text) {
			Ok(req) => self.handle(identity, req).await,
			Err(e) => {
				debug!(user = %identity, error = %e, "rejected lobby frame");
				self.reply(identity, &LobbyResponse::error(e.to_string()));
			}
		}
	}

	pub async fn handle(&self, identity: &Identity, req: LobbyRequest) {
		metrics::counter!("clash_lobby_frames_total", "event" => req.event_name()).increment(1);

		match req {
			LobbyRequest::HostRoom => match self.rooms.host_room(identity).await {
				Ok(room_id) => {
					self.reply(identity, &LobbyResponse::RoomCreated { room_id });
					self.broadcast_rooms().await;
				}
				Err(e) => {
					warn!(user = %identity, error = %e, "host room failed");
					self.reply(identity, &LobbyResponse::error("Could not create room"));
				}
			},
			LobbyRequest::JoinRoom { room_id } => self.join(identity, room_id).await,
			LobbyRequest::LeaveRoom { room_id } => self.leave(identity, room_id).await,
			LobbyRequest::StartGame { room_id } => self.start(identity, room_id).await,
			LobbyRequest::ChatMessage { room_id, text } => self.chat(identity, room_id, &text).await,
		}
	}

	async fn join(&self, identity: &Identity, room_id: RoomId) {
		let frame = match self.rooms.join_room(identity, &room_id).await {
			Ok(JoinOutcome::Joined { .. }) => {
				self.reply(identity, &LobbyResponse::RoomJoined { room_id });
				self.broadcast_rooms().await;
				return;
			}
			Ok(JoinOutcome::AlreadyJoined) => LobbyResponse::AlreadyJoined { room_id },
			Ok(JoinOutcome::NotFound | JoinOutcome::Full | JoinOutcome::Starting) => LobbyResponse::JoinFailed { room_id },
			Err(e) => {
				warn!(user = %identity, %room_id, error = %e, "join room failed");
				LobbyResponse::JoinFailed { room_id }
			}
		};
		self.reply(identity, &frame);
	}

	async fn leave(&self, identity: &Identity, room_id: RoomId) {
		match self.rooms.leave_room(identity, &room_id).await {
			Ok(LeaveOutcome::Left { .. } | LeaveOutcome::Deleted) => {
				self.reply(identity, &LobbyResponse::RoomLeft { room_id });
				self.broadcast_rooms().await;
			}
			Ok(LeaveOutcome::NotFound | LeaveOutcome::Starting) => {
				self.reply(identity, &LobbyResponse::LeaveFailed { room_id });
			}
			Err(e) => {
				warn!(user = %identity, %room_id, error = %e, "leave room failed");
				self.reply(identity, &LobbyResponse::LeaveFailed { room_id });
			}
		}
	}

	/// `START_GAME` itself reaches participants through the event router, on every process.
	async fn start(&self, identity: &Identity, room_id: RoomId) {
		let error = match self.rooms.start_game(identity, &room_id).await {
			Ok(StartOutcome::Started { .. }) => {
				self.broadcast_rooms().await;
				return;
			}
			Ok(StartOutcome::Unavailable) => NO_PUZZLES,
			Ok(StartOutcome::InProgress) => ALREADY_STARTING,
			Ok(StartOutcome::NotFound) => ROOM_NOT_FOUND,
			Ok(StartOutcome::NotMember) => NOT_IN_ROOM,
			Err(e) => {
				warn!(user = %identity, %room_id, error = %e, "start game failed");
				START_FAILED
			}
		};
		self.reply(
			identity,
			&LobbyResponse::StartGameFailed {
				room_id,
				error: error.to_string(),
			},
		);
	}

	async fn chat(&self, identity: &Identity, room_id: RoomId, text: &str) {
		match self.rooms.chat(identity, &room_id, text).await {
			Ok(ChatOutcome::Sent) => {}
			Ok(ChatOutcome::NotFound | ChatOutcome::NotMember) => {
				self.reply(identity, &LobbyResponse::ChatFailed { room_id });
			}
			Err(e) => {
				warn!(user = %identity, %room_id, error = %e, "room chat failed");
				self.reply(identity, &LobbyResponse::ChatFailed { room_id });
			}
		}
	}

	/// Send the current room list to every local lobby socket.
	pub async fn broadcast_rooms(&self) {
		match self.rooms.list_rooms().await {
			Ok(rooms) => {
				self.registry.broadcast_local(&LobbyResponse::RoomsUpdate { rooms });
			}
			Err(e) => warn!(error = %e, "failed to list rooms for broadcast"),
		}
	}

	pub async fn send_rooms_snapshot(&self, username: &Username) {
		match self.rooms.list_rooms().await {
			Ok(rooms) => {
				self.registry.send(username, &LobbyResponse::RoomsUpdate { rooms });
			}
			Err(e) => warn!(%username, error = %e, "failed to list rooms for snapshot"),
		}
	}

	fn reply(&self, identity: &Identity, frame: &LobbyResponse) {
		if !self.registry.send(&identity.username, frame) {
			debug!(user = %identity, "reply not delivered (connection gone)");
		}
	}
}
