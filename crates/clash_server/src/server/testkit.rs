#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use clash_domain::{Identity, PuzzleId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::bus::{EventBus as _, LocalBus};
use crate::server::dispatcher::Dispatcher;
use crate::server::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::server::rooms::{RoomConfig, RoomManager};
use crate::server::router::{spawn_dead_connection_sweeper, spawn_event_router};
use crate::server::sessions::{GameSessionInitiator, MemorySessionStore, SessionDefaults};
use crate::server::store::MemoryStore;

pub fn ident(name: &str) -> Identity {
	Identity::parse(&format!("u-{name}"), name).expect("valid identity")
}

pub fn memory_store() -> Arc<MemoryStore> {
	Arc::new(MemoryStore::new(Duration::from_secs(90)))
}

pub fn sessions_with_puzzle() -> Arc<MemorySessionStore> {
	let sessions = Arc::new(MemorySessionStore::new());
	sessions.add_approved_puzzle(PuzzleId::new("p-1").expect("valid puzzle id"));
	sessions
}

pub fn room_manager(
	server_id: &str,
	store: Arc<MemoryStore>,
	bus: &LocalBus,
	sessions: Arc<MemorySessionStore>,
	cfg: RoomConfig,
) -> RoomManager {
	let initiator = GameSessionInitiator::new(sessions, SessionDefaults::default());
	RoomManager::new(store, Arc::new(bus.clone()), initiator, server_id, cfg)
}

/// One server process: dispatcher plus its event router and dead-connection sweeper.
pub fn node(server_id: &str, store: Arc<MemoryStore>, bus: &LocalBus, sessions: Arc<MemorySessionStore>) -> Dispatcher {
	let rooms = room_manager(server_id, store, bus, sessions, RoomConfig::default());
	let (registry, dead_rx) = ConnectionRegistry::new();
	let dispatcher = Dispatcher::new(rooms, Arc::new(registry));

	spawn_event_router(dispatcher.clone(), bus.subscribe(), server_id);
	spawn_dead_connection_sweeper(dispatcher.clone(), dead_rx);
	dispatcher
}

/// A fake lobby socket: the receiving end of the connection's outbound queue.
pub struct TestClient {
	pub identity: Identity,
	pub connection_id: String,
	pub rx: mpsc::Receiver<Outbound>,
}

impl TestClient {
	pub async fn connect(dispatcher: &Dispatcher, name: &str) -> Self {
		let identity = ident(name);
		let connection_id = uuid::Uuid::new_v4().to_string();
		let (tx, rx) = mpsc::channel(64);
		dispatcher
			.on_connect(&identity, ConnectionHandle::new(connection_id.clone(), tx))
			.await
			.expect("connect");

		Self {
			identity,
			connection_id,
			rx,
		}
	}

	pub async fn send(&self, dispatcher: &Dispatcher, frame: Value) {
		dispatcher.handle_text(&self.identity, &frame.to_string()).await;
	}

	/// Next text frame whose `event` is `event`, skipping everything else.
	pub async fn expect_event(&mut self, event: &str) -> Value {
		self.expect_matching(event, |v| v["event"] == event).await
	}

	/// Next text frame satisfying `pred`, skipping everything else.
	pub async fn expect_matching(&mut self, what: &str, pred: impl Fn(&Value) -> bool) -> Value {
		let deadline = Duration::from_secs(2);
		loop {
			let item = timeout(deadline, self.rx.recv())
				.await
				.unwrap_or_else(|_| panic!("{}: timed out waiting for {what}", self.identity.username))
				.expect("outbound queue open");

			if let Outbound::Text(text) = item {
				let v: Value = serde_json::from_str(&text).expect("frame is json");
				if pred(&v) {
					return v;
				}
			}
		}
	}

	/// Every text frame currently queued.
	pub fn drain(&mut self) -> Vec<Value> {
		let mut out = Vec::new();
		while let Ok(item) = self.rx.try_recv() {
			if let Outbound::Text(text) = item {
				out.push(serde_json::from_str(&text).expect("frame is json"));
			}
		}
		out
	}

	/// Wait briefly and assert no frame named `event` arrived.
	pub async fn expect_no_event(&mut self, event: &str) {
		tokio::time::sleep(Duration::from_millis(100)).await;
		let frames = self.drain();
		assert!(
			frames.iter().all(|f| f["event"] != event),
			"{}: unexpected {event} in {frames:?}",
			self.identity.username
		);
	}
}
