#![forbid(unsafe_code)]

use std::collections::HashMap;

use clash_domain::Username;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Item queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
	Text(String),
	Ping,
	Close { code: u16, reason: String },
}

/// Sending half of one socket's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	connection_id: String,
	tx: mpsc::Sender<Outbound>,
}

/// Outcome of queueing a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Queued,
	/// Queue full; the item was dropped but the socket is alive.
	Dropped,
	/// Writer gone.
	Closed,
}

impl ConnectionHandle {
	pub fn new(connection_id: impl Into<String>, tx: mpsc::Sender<Outbound>) -> Self {
		Self {
			connection_id: connection_id.into(),
			tx,
		}
	}

	pub fn connection_id(&self) -> &str {
		&self.connection_id
	}

	pub fn deliver(&self, item: Outbound) -> Delivery {
		match self.tx.try_send(item) {
			Ok(()) => Delivery::Queued,
			Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
			Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
		}
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// A connection found dead while sending; needs the disconnect cleanup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadConnection {
	pub username: Username,
	pub connection_id: String,
}

/// Per-process map from username to its open lobby socket.
#[derive(Debug)]
pub struct ConnectionRegistry {
	inner: RwLock<HashMap<Username, ConnectionHandle>>,
	dead_tx: mpsc::UnboundedSender<DeadConnection>,
}

impl ConnectionRegistry {
	/// Create a registry plus the stream of connections discovered dead during sends.
	pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadConnection>) {
		let (dead_tx, dead_rx) = mpsc::unbounded_channel();
		(
			Self {
				inner: RwLock::new(HashMap::new()),
				dead_tx,
			},
			dead_rx,
		)
	}

	/// Register `handle` for `username`. An existing socket for the same user is closed and returned.
	pub fn register(&self, username: Username, handle: ConnectionHandle) -> Option<ConnectionHandle> {
		let previous = self.inner.write().insert(username.clone(), handle);

		if let Some(old) = &previous {
			debug!(%username, old_conn = %old.connection_id, "registry: replacing existing connection");
			let _ = old.deliver(Outbound::Close {
				code: 1000,
				reason: "Replaced by a newer connection".to_string(),
			});
		}

		metrics::gauge!("clash_server_connections_active").set(self.len() as f64);
		previous
	}

	/// Remove the entry only if it still belongs to `connection_id`.
	pub fn unregister(&self, username: &Username, connection_id: &str) -> bool {
		let removed = {
			let mut inner = self.inner.write();
			match inner.get(username) {
				Some(h) if h.connection_id == connection_id => inner.remove(username).is_some(),
				_ => false,
			}
		};

		if removed {
			metrics::gauge!("clash_server_connections_active").set(self.len() as f64);
		}
		removed
	}

	pub fn contains(&self, username: &Username) -> bool {
		self.inner.read().contains_key(username)
	}

	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}

	/// Serialize and queue `frame` for `username`.
	///
	/// Returns false when the user has no socket here (they may live on another process) or the send failed.
	pub fn send<T: Serialize>(&self, username: &Username, frame: &T) -> bool {
		match serde_json::to_string(frame) {
			Ok(text) => self.send_text(username, text),
			Err(e) => {
				warn!(%username, error = %e, "registry: failed to encode frame");
				false
			}
		}
	}

	pub fn send_text(&self, username: &Username, text: String) -> bool {
		let Some(handle) = self.inner.read().get(username).cloned() else {
			return false;
		};

		match handle.deliver(Outbound::Text(text)) {
			Delivery::Queued => true,
			Delivery::Dropped => {
				metrics::counter!("clash_server_outbound_dropped_total").increment(1);
				warn!(%username, conn = %handle.connection_id, "registry: outbound queue full; frame dropped");
				false
			}
			Delivery::Closed => {
				self.reap(username, &handle);
				false
			}
		}
	}

	/// Queue `frame` for every local connection; returns how many accepted it.
	pub fn broadcast_local<T: Serialize>(&self, frame: &T) -> usize {
		let text = match serde_json::to_string(frame) {
			Ok(t) => t,
			Err(e) => {
				warn!(error = %e, "registry: failed to encode broadcast frame");
				return 0;
			}
		};

		let targets: Vec<(Username, ConnectionHandle)> =
			self.inner.read().iter().map(|(u, h)| (u.clone(), h.clone())).collect();

		let mut delivered = 0;
		for (username, handle) in targets {
			match handle.deliver(Outbound::Text(text.clone())) {
				Delivery::Queued => delivered += 1,
				Delivery::Dropped => {
					metrics::counter!("clash_server_outbound_dropped_total").increment(1);
				}
				Delivery::Closed => self.reap(&username, &handle),
			}
		}
		delivered
	}

	/// Ask every socket to close.
	pub fn close_all(&self, code: u16, reason: &str) {
		let handles: Vec<ConnectionHandle> = self.inner.read().values().cloned().collect();
		for h in handles {
			let _ = h.deliver(Outbound::Close {
				code,
				reason: reason.to_string(),
			});
		}
	}

	fn reap(&self, username: &Username, handle: &ConnectionHandle) {
		if self.unregister(username, &handle.connection_id) {
			debug!(%username, conn = %handle.connection_id, "registry: dropping dead connection");
			let _ = self.dead_tx.send(DeadConnection {
				username: username.clone(),
				connection_id: handle.connection_id.clone(),
			});
		}
	}
}
