#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use clash_domain::{Room, RoomId, RoomMember, RoomPhase, UserId, UserPresence, Username};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("coordination store unavailable: {0}")]
	Unavailable(String),
	#[error("corrupt record at {key}: {detail}")]
	Corrupt { key: String, detail: String },
}

impl From<redis::RedisError> for StoreError {
	fn from(e: redis::RedisError) -> Self {
		StoreError::Unavailable(e.to_string())
	}
}

/// Result of the atomic add-player operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResult {
	Joined(Room),
	AlreadyJoined,
	NotFound,
	Full,
	Starting,
}

/// Result of the atomic remove-player operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveResult {
	/// Remaining room (ownership already transferred if the owner left).
	Left(Room),
	/// Last player left; the room is gone.
	Deleted,
	NotMember,
	NotFound,
	/// A live start claim freezes the player set.
	Starting,
}

/// Result of the conditional `open -> starting` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartClaim {
	Claimed(Room),
	InProgress,
	NotFound,
}

/// Shared presence and room state, visible to every server process.
///
/// Every multi-step change is a single atomic operation on the backing store.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
	/// Cheap round trip used by readiness checks.
	async fn ping(&self) -> Result<(), StoreError>;

	async fn get_presence(&self, username: &Username) -> Result<Option<UserPresence>, StoreError>;

	/// Write presence with a fresh TTL.
	async fn set_presence(&self, presence: &UserPresence) -> Result<(), StoreError>;

	/// Refresh `lastSeen` and the TTL; false if the entry is gone.
	async fn touch_presence(&self, username: &Username, now_ms: i64) -> Result<bool, StoreError>;

	/// Point presence at a room (or none). No-op if the entry is gone.
	async fn set_presence_room(&self, username: &Username, room_id: Option<&RoomId>) -> Result<(), StoreError>;

	/// Delete presence only if it still belongs to `connection_id`.
	async fn delete_presence(&self, username: &Username, connection_id: &str) -> Result<bool, StoreError>;

	async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError>;

	async fn set_room(&self, room: &Room) -> Result<(), StoreError>;

	/// Snapshot of all rooms, oldest first.
	async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

	async fn add_player(&self, room_id: &RoomId, member: &RoomMember) -> Result<JoinResult, StoreError>;

	/// Refused with `Starting` while a claim younger than `lease_ms` is held; an older claim is dropped.
	async fn remove_player(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		now_ms: i64,
		lease_ms: i64,
	) -> Result<LeaveResult, StoreError>;

	/// Move the room to `starting` under `token` unless a claim younger than `lease_ms` exists.
	async fn claim_start(
		&self,
		room_id: &RoomId,
		token: &str,
		now_ms: i64,
		lease_ms: i64,
	) -> Result<StartClaim, StoreError>;

	/// Return the room to `open` if `token` still holds the claim.
	async fn release_start(&self, room_id: &RoomId, token: &str) -> Result<bool, StoreError>;

	/// Delete the room if `token` still holds the claim, returning the deleted record.
	async fn finish_start(&self, room_id: &RoomId, token: &str) -> Result<Option<Room>, StoreError>;
}

/// Apply a join to an in-memory room; shared rule set for every backend.
pub(crate) fn apply_join(room: &mut Room, member: &RoomMember) -> JoinResult {
	if room.phase == RoomPhase::Starting {
		return JoinResult::Starting;
	}
	if room.contains(&member.user_id) {
		return JoinResult::AlreadyJoined;
	}
	if room.is_full() {
		return JoinResult::Full;
	}
	room.players.push(member.clone());
	JoinResult::Joined(room.clone())
}

/// Remove a member; `None` means the room became empty.
pub(crate) fn apply_leave(room: &mut Room, user_id: &UserId, now_ms: i64, lease_ms: i64) -> Option<LeaveResult> {
	if !room.contains(user_id) {
		return Some(LeaveResult::NotMember);
	}
	if room.start_in_progress(now_ms, lease_ms) {
		return Some(LeaveResult::Starting);
	}
	if room.phase == RoomPhase::Starting {
		room.clear_start_claim();
	}
	room.players.retain(|p| &p.user_id != user_id);

	let first = room.players.first()?.clone();
	if &room.owner_id == user_id {
		room.owner_id = first.user_id;
		room.owner_username = first.username;
	}
	Some(LeaveResult::Left(room.clone()))
}

/// Single-process store. Used when no shared store is configured, and by tests.
#[derive(Debug)]
pub struct MemoryStore {
	presence_ttl: Duration,
	inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
	presence: HashMap<Username, (UserPresence, Instant)>,
	rooms: HashMap<RoomId, Room>,
}

impl MemoryStore {
	pub fn new(presence_ttl: Duration) -> Self {
		Self {
			presence_ttl,
			inner: Mutex::new(MemoryInner::default()),
		}
	}

	fn live_presence<'a>(inner: &'a mut MemoryInner, username: &Username) -> Option<&'a mut UserPresence> {
		let expired = inner
			.presence
			.get(username)
			.is_some_and(|(_, expires_at)| *expires_at <= Instant::now());
		if expired {
			inner.presence.remove(username);
			return None;
		}
		inner.presence.get_mut(username).map(|(p, _)| p)
	}
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}

	async fn get_presence(&self, username: &Username) -> Result<Option<UserPresence>, StoreError> {
		let mut inner = self.inner.lock();
		Ok(Self::live_presence(&mut inner, username).cloned())
	}

	async fn set_presence(&self, presence: &UserPresence) -> Result<(), StoreError> {
		let expires_at = Instant::now() + self.presence_ttl;
		self.inner
			.lock()
			.presence
			.insert(presence.username.clone(), (presence.clone(), expires_at));
		Ok(())
	}

	async fn touch_presence(&self, username: &Username, now_ms: i64) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		if Self::live_presence(&mut inner, username).is_none() {
			return Ok(false);
		}
		if let Some((p, expires_at)) = inner.presence.get_mut(username) {
			p.last_seen_ms = now_ms;
			*expires_at = Instant::now() + self.presence_ttl;
		}
		Ok(true)
	}

	async fn set_presence_room(&self, username: &Username, room_id: Option<&RoomId>) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		if let Some(p) = Self::live_presence(&mut inner, username) {
			p.room_id = room_id.cloned();
		}
		Ok(())
	}

	async fn delete_presence(&self, username: &Username, connection_id: &str) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		let owned = inner
			.presence
			.get(username)
			.is_some_and(|(p, _)| p.connection_id == connection_id);
		if owned {
			inner.presence.remove(username);
		}
		Ok(owned)
	}

	async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
		Ok(self.inner.lock().rooms.get(room_id).cloned())
	}

	async fn set_room(&self, room: &Room) -> Result<(), StoreError> {
		self.inner.lock().rooms.insert(room.room_id.clone(), room.clone());
		Ok(())
	}

	async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
		let mut rooms: Vec<Room> = self.inner.lock().rooms.values().cloned().collect();
		sort_rooms(&mut rooms);
		Ok(rooms)
	}

	async fn add_player(&self, room_id: &RoomId, member: &RoomMember) -> Result<JoinResult, StoreError> {
		let mut inner = self.inner.lock();
		let Some(room) = inner.rooms.get_mut(room_id) else {
			return Ok(JoinResult::NotFound);
		};
		Ok(apply_join(room, member))
	}

	async fn remove_player(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		now_ms: i64,
		lease_ms: i64,
	) -> Result<LeaveResult, StoreError> {
		let mut inner = self.inner.lock();
		let Some(room) = inner.rooms.get_mut(room_id) else {
			return Ok(LeaveResult::NotFound);
		};
		match apply_leave(room, user_id, now_ms, lease_ms) {
			Some(result) => Ok(result),
			None => {
				inner.rooms.remove(room_id);
				Ok(LeaveResult::Deleted)
			}
		}
	}

	async fn claim_start(
		&self,
		room_id: &RoomId,
		token: &str,
		now_ms: i64,
		lease_ms: i64,
	) -> Result<StartClaim, StoreError> {
		let mut inner = self.inner.lock();
		let Some(room) = inner.rooms.get_mut(room_id) else {
			return Ok(StartClaim::NotFound);
		};
		if room.start_in_progress(now_ms, lease_ms) {
			return Ok(StartClaim::InProgress);
		}
		room.phase = RoomPhase::Starting;
		room.starting_since_ms = Some(now_ms);
		room.start_token = Some(token.to_string());
		Ok(StartClaim::Claimed(room.clone()))
	}

	async fn release_start(&self, room_id: &RoomId, token: &str) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		match inner.rooms.get_mut(room_id) {
			Some(room) if room.holds_start_claim(token) => {
				room.clear_start_claim();
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn finish_start(&self, room_id: &RoomId, token: &str) -> Result<Option<Room>, StoreError> {
		let mut inner = self.inner.lock();
		if !inner.rooms.get(room_id).is_some_and(|r| r.holds_start_claim(token)) {
			return Ok(None);
		}
		Ok(inner.rooms.remove(room_id))
	}
}

pub(crate) fn sort_rooms(rooms: &mut [Room]) {
	rooms.sort_by(|a, b| {
		a.created_at_ms
			.cmp(&b.created_at_ms)
			.then_with(|| a.room_id.cmp(&b.room_id))
	});
}
