#![forbid(unsafe_code)]

use std::time::Duration;

use clash_domain::LifecycleEvent;
use clash_protocol::LobbyResponse;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::bus::{BusEnvelope, BusReceiver};
use crate::server::dispatcher::Dispatcher;
use crate::server::registry::DeadConnection;

/// Consumes every lifecycle event and turns it into frames for this process's lobby sockets.
pub struct EventRouter {
	dispatcher: Dispatcher,
	events: BusReceiver,
	server_id: String,
}

impl EventRouter {
	pub fn new(dispatcher: Dispatcher, events: BusReceiver, server_id: impl Into<String>) -> Self {
		Self {
			dispatcher,
			events,
			server_id: server_id.into(),
		}
	}

	/// Run until the bus is closed.
	pub async fn run(mut self) {
		info!(server_id = %self.server_id, "event router started");

		loop {
			let envelope = match self.events.recv().await {
				Ok(env) => env,
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(lagged = n, "event router lagged; resyncing lobby listings");
					self.dispatcher.broadcast_rooms().await;
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => {
					info!("event router exiting (bus closed)");
					break;
				}
			};

			metrics::counter!("clash_bus_events_total", "direction" => "in").increment(1);
			route_one(&self.dispatcher, &self.server_id, envelope).await;
		}
	}
}

/// Apply one envelope to local connections.
pub async fn route_one(dispatcher: &Dispatcher, server_id: &str, envelope: BusEnvelope) {
	let remote = envelope.origin != server_id;
	let registry = dispatcher.registry();

	match envelope.event {
		LifecycleEvent::User { action, username, .. } => {
			debug!(origin = %envelope.origin, ?action, %username, "user lifecycle event");
		}
		LifecycleEvent::Room { room_id, .. } => {
			// Local mutations already broadcast from the dispatcher.
			if remote {
				debug!(origin = %envelope.origin, %room_id, "remote room change");
				dispatcher.broadcast_rooms().await;
			}
		}
		LifecycleEvent::RoomChat {
			room_id,
			username,
			text,
			created_at,
			recipients,
		} => {
			let frame = LobbyResponse::ChatMessage {
				room_id,
				username,
				text,
				created_at,
			};
			for recipient in &recipients {
				registry.send(recipient, &frame);
			}
		}
		LifecycleEvent::Game {
			room_id,
			session_id,
			game_url,
			players,
			..
		} => {
			let frame = LobbyResponse::StartGame { game_url };
			let delivered = players.iter().filter(|p| registry.send(p, &frame)).count();
			debug!(%room_id, %session_id, delivered, "start game delivered to local players");

			if remote {
				dispatcher.broadcast_rooms().await;
			}
		}
	}
}

/// Spawn the router task for `dispatcher`.
pub fn spawn_event_router(dispatcher: Dispatcher, events: BusReceiver, server_id: impl Into<String>) -> JoinHandle<()> {
	let router = EventRouter::new(dispatcher, events, server_id);
	tokio::spawn(router.run())
}

/// Run disconnect cleanup for sockets the registry found dead while sending.
pub fn spawn_dead_connection_sweeper(
	dispatcher: Dispatcher,
	mut dead_rx: mpsc::UnboundedReceiver<DeadConnection>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(dead) = dead_rx.recv().await {
			debug!(username = %dead.username, conn = %dead.connection_id, "sweeping dead connection");
			dispatcher.on_dead_connection(dead).await;
		}
	})
}

/// Periodically drop room members whose presence expired.
pub fn spawn_presence_reaper(dispatcher: Dispatcher, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// First tick fires immediately.
		ticker.tick().await;

		loop {
			ticker.tick().await;
			match dispatcher.rooms().reap_stale_members().await {
				Ok(0) => {}
				Ok(n) => {
					metrics::counter!("clash_presence_reaped_total").increment(n as u64);
					info!(removed = n, "reaped members with expired presence");
					dispatcher.broadcast_rooms().await;
				}
				Err(e) => warn!(error = %e, "presence reaper failed"),
			}
		}
	})
}
