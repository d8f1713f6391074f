#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::server::bus::{BusEnvelope, BusError, BusReceiver, EventBus};

const RECONNECT_MIN_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Event bus on a single Redis pub/sub channel.
///
/// A background task holds the subscription, reconnects with backoff, and republishes every
/// decoded envelope into a local broadcast channel.
pub struct RedisBus {
	channel: String,
	pub_conn: MultiplexedConnection,
	local_tx: broadcast::Sender<BusEnvelope>,
}

impl RedisBus {
	pub async fn connect(url: &str, prefix: &str, capacity: usize) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("open redis client")?;
		let pub_conn = client
			.get_multiplexed_tokio_connection()
			.await
			.context("connect redis (bus publisher)")?;

		let channel = format!("{prefix}:lifecycle");
		let (local_tx, _rx) = broadcast::channel(capacity);

		tokio::spawn(run_subscriber(client, channel.clone(), local_tx.clone()));

		Ok(Self {
			channel,
			pub_conn,
			local_tx,
		})
	}
}

#[async_trait::async_trait]
impl EventBus for RedisBus {
	async fn publish(&self, envelope: BusEnvelope) -> Result<(), BusError> {
		let payload = serde_json::to_string(&envelope)?;
		let mut conn = self.pub_conn.clone();
		let _: i64 = redis::cmd("PUBLISH")
			.arg(&self.channel)
			.arg(payload)
			.query_async(&mut conn)
			.await?;
		metrics::counter!("clash_bus_events_total", "direction" => "out").increment(1);
		Ok(())
	}

	fn subscribe(&self) -> BusReceiver {
		self.local_tx.subscribe()
	}
}

async fn run_subscriber(client: redis::Client, channel: String, local_tx: broadcast::Sender<BusEnvelope>) {
	let mut delay = RECONNECT_MIN_DELAY;

	loop {
		match subscribe_once(&client, &channel, &local_tx).await {
			Ok(()) => {
				warn!(%channel, "redis bus: subscription stream ended; reconnecting");
				delay = RECONNECT_MIN_DELAY;
			}
			Err(e) => {
				warn!(%channel, error = %e, retry_ms = delay.as_millis() as u64, "redis bus: subscriber failed");
			}
		}

		metrics::counter!("clash_bus_reconnects_total").increment(1);
		tokio::time::sleep(delay).await;
		delay = (delay * 2).min(RECONNECT_MAX_DELAY);
	}
}

async fn subscribe_once(
	client: &redis::Client,
	channel: &str,
	local_tx: &broadcast::Sender<BusEnvelope>,
) -> anyhow::Result<()> {
	let mut pubsub = client.get_async_pubsub().await.context("open pubsub connection")?;
	pubsub.subscribe(channel).await.context("subscribe")?;
	info!(%channel, "redis bus: subscribed");

	let mut messages = pubsub.into_on_message();
	while let Some(msg) = messages.next().await {
		let payload: String = match msg.get_payload() {
			Ok(p) => p,
			Err(e) => {
				warn!(error = %e, "redis bus: non-text payload ignored");
				continue;
			}
		};

		match serde_json::from_str::<BusEnvelope>(&payload) {
			Ok(envelope) => {
				let _ = local_tx.send(envelope);
			}
			Err(e) => debug!(error = %e, "redis bus: undecodable envelope ignored"),
		}
	}

	Ok(())
}
