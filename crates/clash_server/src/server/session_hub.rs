#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use clash_domain::{SessionId, Username};
use clash_protocol::GameResponse;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::server::registry::Outbound;

/// Per-session fan-out for in-game sockets.
#[derive(Debug, Clone, Default)]
pub struct SessionHub {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	sessions: HashMap<SessionId, SessionEntry>,
}

#[derive(Debug, Default)]
struct SessionEntry {
	subscribers: HashMap<Username, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	connection_id: String,
	tx: mpsc::Sender<Outbound>,
}

impl SessionHub {
	pub fn new() -> Self {
		Self::default()
	}

	/// Subscribe `username` to `session`. A second socket for the same user replaces the first.
	pub async fn join(&self, session: &SessionId, username: Username, connection_id: &str, tx: mpsc::Sender<Outbound>) {
		let mut inner = self.inner.lock().await;
		let entry = inner.sessions.entry(session.clone()).or_default();
		prune_closed(entry);

		let replaced = entry.subscribers.insert(
			username.clone(),
			Subscriber {
				connection_id: connection_id.to_string(),
				tx,
			},
		);
		if let Some(old) = replaced {
			let _ = old.tx.try_send(Outbound::Close {
				code: 1000,
				reason: "Replaced by a newer connection".to_string(),
			});
		}

		debug!(%session, %username, subs = entry.subscribers.len(), "session hub: joined");
	}

	/// Drop the subscription if it still belongs to `connection_id`.
	pub async fn leave(&self, session: &SessionId, username: &Username, connection_id: &str) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.sessions.get_mut(session) else {
			return false;
		};

		let removed = match entry.subscribers.get(username) {
			Some(sub) if sub.connection_id == connection_id => entry.subscribers.remove(username).is_some(),
			_ => false,
		};

		prune_closed(entry);
		if entry.subscribers.is_empty() {
			inner.sessions.remove(session);
		}
		removed
	}

	/// Queue `frame` for one subscriber of `session`.
	pub async fn send_to(&self, session: &SessionId, username: &Username, frame: &GameResponse) -> bool {
		let Some(text) = encode(frame) else {
			return false;
		};

		let inner = self.inner.lock().await;
		inner
			.sessions
			.get(session)
			.and_then(|e| e.subscribers.get(username))
			.is_some_and(|sub| sub.tx.try_send(Outbound::Text(text)).is_ok())
	}

	/// Queue `frame` for every subscriber of `session`; returns how many accepted it.
	pub async fn broadcast(&self, session: &SessionId, frame: &GameResponse) -> usize {
		let Some(text) = encode(frame) else {
			return 0;
		};

		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.sessions.get_mut(session) else {
			return 0;
		};

		let mut delivered = 0;
		let mut dropped: u64 = 0;
		for sub in entry.subscribers.values() {
			match sub.tx.try_send(Outbound::Text(text.clone())) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed(entry);
		if entry.subscribers.is_empty() {
			inner.sessions.remove(session);
		}

		if dropped > 0 {
			metrics::counter!("clash_session_hub_dropped_total").increment(dropped);
			debug!(%session, dropped, "session hub: dropped due to full subscriber queues");
		}
		delivered
	}

	/// Ask every in-game socket to close.
	pub async fn close_all(&self, code: u16, reason: &str) {
		let inner = self.inner.lock().await;
		for sub in inner.sessions.values().flat_map(|e| e.subscribers.values()) {
			let _ = sub.tx.try_send(Outbound::Close {
				code,
				reason: reason.to_string(),
			});
		}
	}
}

fn encode(frame: &GameResponse) -> Option<String> {
	match serde_json::to_string(frame) {
		Ok(text) => Some(text),
		Err(e) => {
			warn!(error = %e, "session hub: failed to encode frame");
			None
		}
	}
}

fn prune_closed(entry: &mut SessionEntry) {
	entry.subscribers.retain(|_, s| !s.tx.is_closed());
}
