#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use clash_domain::{Room, RoomId, RoomMember, UserId, UserPresence, Username};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::server::store::{CoordinationStore, JoinResult, LeaveResult, StartClaim, StoreError, sort_rooms};

// Rooms and presence are JSON documents; every read-modify-write runs as one Lua script.

const JOIN_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {'not_found'} end
local room = cjson.decode(raw)
if room.phase == 'starting' then return {'starting'} end
local member = cjson.decode(ARGV[1])
for _, p in ipairs(room.players) do
  if p.userId == member.userId then return {'already_joined'} end
end
if #room.players >= tonumber(room.maxPlayers) then return {'full'} end
table.insert(room.players, member)
local encoded = cjson.encode(room)
redis.call('SET', KEYS[1], encoded)
return {'joined', encoded}
"#;

const LEAVE_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {'not_found'} end
local room = cjson.decode(raw)
local kept = {}
local found = false
for _, p in ipairs(room.players) do
  if p.userId == ARGV[1] then found = true else table.insert(kept, p) end
end
if not found then return {'not_member'} end
if room.phase == 'starting' then
  local since = tonumber(room.startingSinceMs)
  if since == nil or (tonumber(ARGV[3]) - since) < tonumber(ARGV[4]) then return {'starting'} end
  room.phase = 'open'
  room.startingSinceMs = nil
  room.startToken = nil
end
if #kept == 0 then
  redis.call('DEL', KEYS[1])
  redis.call('SREM', KEYS[2], ARGV[2])
  return {'deleted'}
end
room.players = kept
if room.ownerId == ARGV[1] then
  room.ownerId = kept[1].userId
  room.ownerUsername = kept[1].username
end
local encoded = cjson.encode(room)
redis.call('SET', KEYS[1], encoded)
return {'left', encoded}
"#;

const CLAIM_START_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {'not_found'} end
local room = cjson.decode(raw)
local now = tonumber(ARGV[1])
if room.phase == 'starting' then
  local since = tonumber(room.startingSinceMs)
  if since == nil or (now - since) < tonumber(ARGV[2]) then return {'in_progress'} end
end
room.phase = 'starting'
room.startingSinceMs = now
room.startToken = ARGV[3]
local encoded = cjson.encode(room)
redis.call('SET', KEYS[1], encoded)
return {'claimed', encoded}
"#;

const RELEASE_START_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local room = cjson.decode(raw)
if room.phase ~= 'starting' or room.startToken ~= ARGV[1] then return 0 end
room.phase = 'open'
room.startingSinceMs = nil
room.startToken = nil
redis.call('SET', KEYS[1], cjson.encode(room))
return 1
"#;

const FINISH_START_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {'lost'} end
local room = cjson.decode(raw)
if room.phase ~= 'starting' or room.startToken ~= ARGV[1] then return {'lost'} end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
return {'finished', raw}
"#;

const TOUCH_PRESENCE_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local p = cjson.decode(raw)
p.lastSeenMs = tonumber(ARGV[1])
redis.call('SET', KEYS[1], cjson.encode(p), 'PX', ARGV[2])
return 1
"#;

const PRESENCE_ROOM_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local p = cjson.decode(raw)
if ARGV[1] == '' then p.roomId = nil else p.roomId = ARGV[1] end
redis.call('SET', KEYS[1], cjson.encode(p), 'KEEPTTL')
return 1
"#;

const DELETE_PRESENCE_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local p = cjson.decode(raw)
if p.connectionId ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
return 1
"#;

struct Scripts {
	join: redis::Script,
	leave: redis::Script,
	claim_start: redis::Script,
	release_start: redis::Script,
	finish_start: redis::Script,
	touch_presence: redis::Script,
	presence_room: redis::Script,
	delete_presence: redis::Script,
}

impl Scripts {
	fn load() -> Self {
		Self {
			join: redis::Script::new(JOIN_LUA),
			leave: redis::Script::new(LEAVE_LUA),
			claim_start: redis::Script::new(CLAIM_START_LUA),
			release_start: redis::Script::new(RELEASE_START_LUA),
			finish_start: redis::Script::new(FINISH_START_LUA),
			touch_presence: redis::Script::new(TOUCH_PRESENCE_LUA),
			presence_room: redis::Script::new(PRESENCE_ROOM_LUA),
			delete_presence: redis::Script::new(DELETE_PRESENCE_LUA),
		}
	}
}

/// Coordination store backed by Redis.
///
/// Keys: `<prefix>:presence:<username>` (with TTL), `<prefix>:room:<roomId>`, and the
/// `<prefix>:rooms` set indexing live room ids.
pub struct RedisStore {
	conn: MultiplexedConnection,
	prefix: String,
	presence_ttl: Duration,
	scripts: Scripts,
}

impl RedisStore {
	pub async fn connect(url: &str, prefix: &str, presence_ttl: Duration) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("open redis client")?;
		let conn = client
			.get_multiplexed_tokio_connection()
			.await
			.context("connect redis (store)")?;

		Ok(Self {
			conn,
			prefix: prefix.to_string(),
			presence_ttl,
			scripts: Scripts::load(),
		})
	}

	fn presence_key(&self, username: &Username) -> String {
		format!("{}:presence:{}", self.prefix, username)
	}

	fn room_key(&self, room_id: &RoomId) -> String {
		format!("{}:room:{}", self.prefix, room_id)
	}

	fn rooms_index_key(&self) -> String {
		format!("{}:rooms", self.prefix)
	}

	fn ttl_ms(&self) -> u64 {
		self.presence_ttl.as_millis().max(1) as u64
	}
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
	serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
		key: key.to_string(),
		detail: e.to_string(),
	})
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
	serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
		key: key.to_string(),
		detail: e.to_string(),
	})
}

/// Split a `{status, json?}` script reply.
fn script_reply(key: &str, reply: &[String]) -> Result<(String, Option<Room>), StoreError> {
	let status = reply.first().cloned().ok_or_else(|| StoreError::Corrupt {
		key: key.to_string(),
		detail: "empty script reply".into(),
	})?;
	let room = reply.get(1).map(|raw| decode::<Room>(key, raw)).transpose()?;
	Ok((status, room))
}

fn unexpected(key: &str, status: &str) -> StoreError {
	StoreError::Corrupt {
		key: key.to_string(),
		detail: format!("unexpected script status `{status}`"),
	}
}

#[async_trait::async_trait]
impl CoordinationStore for RedisStore {
	async fn ping(&self) -> Result<(), StoreError> {
		let mut conn = self.conn.clone();
		let _: String = redis::cmd("PING").query_async(&mut conn).await?;
		Ok(())
	}

	async fn get_presence(&self, username: &Username) -> Result<Option<UserPresence>, StoreError> {
		let key = self.presence_key(username);
		let mut conn = self.conn.clone();
		let raw: Option<String> = conn.get(&key).await?;
		raw.map(|r| decode(&key, &r)).transpose()
	}

	async fn set_presence(&self, presence: &UserPresence) -> Result<(), StoreError> {
		let key = self.presence_key(&presence.username);
		let json = encode(&key, presence)?;
		let mut conn = self.conn.clone();
		let _: () = redis::cmd("SET")
			.arg(&key)
			.arg(json)
			.arg("PX")
			.arg(self.ttl_ms())
			.query_async(&mut conn)
			.await?;
		Ok(())
	}

	async fn touch_presence(&self, username: &Username, now_ms: i64) -> Result<bool, StoreError> {
		let mut conn = self.conn.clone();
		let touched: i64 = self
			.scripts
			.touch_presence
			.key(self.presence_key(username))
			.arg(now_ms)
			.arg(self.ttl_ms())
			.invoke_async(&mut conn)
			.await?;
		Ok(touched == 1)
	}

	async fn set_presence_room(&self, username: &Username, room_id: Option<&RoomId>) -> Result<(), StoreError> {
		let mut conn = self.conn.clone();
		let _: i64 = self
			.scripts
			.presence_room
			.key(self.presence_key(username))
			.arg(room_id.map(RoomId::as_str).unwrap_or(""))
			.invoke_async(&mut conn)
			.await?;
		Ok(())
	}

	async fn delete_presence(&self, username: &Username, connection_id: &str) -> Result<bool, StoreError> {
		let mut conn = self.conn.clone();
		let deleted: i64 = self
			.scripts
			.delete_presence
			.key(self.presence_key(username))
			.arg(connection_id)
			.invoke_async(&mut conn)
			.await?;
		Ok(deleted == 1)
	}

	async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
		let key = self.room_key(room_id);
		let mut conn = self.conn.clone();
		let raw: Option<String> = conn.get(&key).await?;
		raw.map(|r| decode(&key, &r)).transpose()
	}

	async fn set_room(&self, room: &Room) -> Result<(), StoreError> {
		let key = self.room_key(&room.room_id);
		let json = encode(&key, room)?;
		let mut conn = self.conn.clone();
		let _: () = redis::pipe()
			.atomic()
			.set(&key, json)
			.ignore()
			.sadd(self.rooms_index_key(), room.room_id.as_str())
			.ignore()
			.query_async(&mut conn)
			.await?;
		Ok(())
	}

	async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
		let mut conn = self.conn.clone();
		let ids: Vec<String> = conn.smembers(self.rooms_index_key()).await?;
		if ids.is_empty() {
			return Ok(Vec::new());
		}

		let keys: Vec<String> = ids
			.iter()
			.map(|id| format!("{}:room:{}", self.prefix, id))
			.collect();
		let raws: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

		let mut rooms = Vec::with_capacity(raws.len());
		let mut stale = Vec::new();
		for ((id, key), raw) in ids.iter().zip(keys.iter()).zip(raws) {
			match raw {
				Some(raw) => rooms.push(decode::<Room>(key, &raw)?),
				None => stale.push(id.clone()),
			}
		}

		if !stale.is_empty() {
			debug!(count = stale.len(), "redis store: pruning stale room index entries");
			let _: i64 = conn.srem(self.rooms_index_key(), &stale).await?;
		}

		sort_rooms(&mut rooms);
		Ok(rooms)
	}

	async fn add_player(&self, room_id: &RoomId, member: &RoomMember) -> Result<JoinResult, StoreError> {
		let key = self.room_key(room_id);
		let member_json = encode(&key, member)?;
		let mut conn = self.conn.clone();
		let reply: Vec<String> = self
			.scripts
			.join
			.key(&key)
			.arg(member_json)
			.invoke_async(&mut conn)
			.await?;

		match script_reply(&key, &reply)? {
			(s, Some(room)) if s == "joined" => Ok(JoinResult::Joined(room)),
			(s, _) if s == "already_joined" => Ok(JoinResult::AlreadyJoined),
			(s, _) if s == "not_found" => Ok(JoinResult::NotFound),
			(s, _) if s == "full" => Ok(JoinResult::Full),
			(s, _) if s == "starting" => Ok(JoinResult::Starting),
			(s, _) => Err(unexpected(&key, &s)),
		}
	}

	async fn remove_player(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		now_ms: i64,
		lease_ms: i64,
	) -> Result<LeaveResult, StoreError> {
		let key = self.room_key(room_id);
		let mut conn = self.conn.clone();
		let reply: Vec<String> = self
			.scripts
			.leave
			.key(&key)
			.key(self.rooms_index_key())
			.arg(user_id.as_str())
			.arg(room_id.as_str())
			.arg(now_ms)
			.arg(lease_ms)
			.invoke_async(&mut conn)
			.await?;

		match script_reply(&key, &reply)? {
			(s, Some(room)) if s == "left" => Ok(LeaveResult::Left(room)),
			(s, _) if s == "deleted" => Ok(LeaveResult::Deleted),
			(s, _) if s == "not_member" => Ok(LeaveResult::NotMember),
			(s, _) if s == "not_found" => Ok(LeaveResult::NotFound),
			(s, _) if s == "starting" => Ok(LeaveResult::Starting),
			(s, _) => Err(unexpected(&key, &s)),
		}
	}

	async fn claim_start(
		&self,
		room_id: &RoomId,
		token: &str,
		now_ms: i64,
		lease_ms: i64,
	) -> Result<StartClaim, StoreError> {
		let key = self.room_key(room_id);
		let mut conn = self.conn.clone();
		let reply: Vec<String> = self
			.scripts
			.claim_start
			.key(&key)
			.arg(now_ms)
			.arg(lease_ms)
			.arg(token)
			.invoke_async(&mut conn)
			.await?;

		match script_reply(&key, &reply)? {
			(s, Some(room)) if s == "claimed" => Ok(StartClaim::Claimed(room)),
			(s, _) if s == "in_progress" => Ok(StartClaim::InProgress),
			(s, _) if s == "not_found" => Ok(StartClaim::NotFound),
			(s, _) => Err(unexpected(&key, &s)),
		}
	}

	async fn release_start(&self, room_id: &RoomId, token: &str) -> Result<bool, StoreError> {
		let mut conn = self.conn.clone();
		let released: i64 = self
			.scripts
			.release_start
			.key(self.room_key(room_id))
			.arg(token)
			.invoke_async(&mut conn)
			.await?;
		Ok(released == 1)
	}

	async fn finish_start(&self, room_id: &RoomId, token: &str) -> Result<Option<Room>, StoreError> {
		let key = self.room_key(room_id);
		let mut conn = self.conn.clone();
		let reply: Vec<String> = self
			.scripts
			.finish_start
			.key(&key)
			.key(self.rooms_index_key())
			.arg(token)
			.arg(room_id.as_str())
			.invoke_async(&mut conn)
			.await?;

		match script_reply(&key, &reply)? {
			(s, Some(room)) if s == "finished" => Ok(Some(room)),
			(s, _) if s == "lost" => Ok(None),
			(s, _) => Err(unexpected(&key, &s)),
		}
	}
}
