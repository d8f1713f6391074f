#![forbid(unsafe_code)]

use clash_domain::LifecycleEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default capacity of the per-process fan-out of bus events.
pub const DEFAULT_BUS_CAPACITY: usize = 4_096;

/// Wire envelope: the event plus the server process that published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
	pub origin: String,
	pub event: LifecycleEvent,
}

#[derive(Debug, Error)]
pub enum BusError {
	#[error("event bus unavailable: {0}")]
	Unavailable(String),
	#[error("encode bus event: {0}")]
	Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BusError {
	fn from(e: redis::RedisError) -> Self {
		BusError::Unavailable(e.to_string())
	}
}

/// Subscription to every lifecycle event, including this process's own.
pub type BusReceiver = broadcast::Receiver<BusEnvelope>;

/// Single shared lifecycle channel. Delivery is at-most-once.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
	async fn publish(&self, envelope: BusEnvelope) -> Result<(), BusError>;

	fn subscribe(&self) -> BusReceiver;
}

/// In-process bus. Processes sharing one `LocalBus` behave like processes sharing a Redis channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
	tx: broadcast::Sender<BusEnvelope>,
}

impl LocalBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity);
		Self { tx }
	}
}

impl Default for LocalBus {
	fn default() -> Self {
		Self::new(DEFAULT_BUS_CAPACITY)
	}
}

#[async_trait::async_trait]
impl EventBus for LocalBus {
	async fn publish(&self, envelope: BusEnvelope) -> Result<(), BusError> {
		metrics::counter!("clash_bus_events_total", "direction" => "out").increment(1);
		// No subscribers is not an error.
		let _ = self.tx.send(envelope);
		Ok(())
	}

	fn subscribe(&self) -> BusReceiver {
		self.tx.subscribe()
	}
}
