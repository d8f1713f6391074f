#![forbid(unsafe_code)]

//! Runs only when `CLASH_TEST_REDIS_URL` points at a disposable Redis.

use std::time::Duration;

use clash_domain::{LifecycleEvent, UserAction};
use tokio::time::timeout;

use crate::server::bus::{BusEnvelope, EventBus};
use crate::server::redis_bus::RedisBus;
use crate::server::redis_store::RedisStore;
use crate::server::store_tests::store_contract;
use crate::server::testkit::ident;

fn redis_url() -> Option<String> {
	std::env::var("CLASH_TEST_REDIS_URL").ok().filter(|s| !s.trim().is_empty())
}

fn fresh_prefix() -> String {
	format!("clash-test-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn redis_store_matches_memory_behavior() {
	let Some(url) = redis_url() else {
		eprintln!("CLASH_TEST_REDIS_URL not set; skipping");
		return;
	};
	let store = RedisStore::connect(&url, &fresh_prefix(), Duration::from_secs(90))
		.await
		.unwrap();
	store_contract(&store, "redis").await;
}

#[tokio::test]
async fn redis_bus_delivers_between_processes() {
	let Some(url) = redis_url() else {
		eprintln!("CLASH_TEST_REDIS_URL not set; skipping");
		return;
	};
	let prefix = fresh_prefix();
	let a = RedisBus::connect(&url, &prefix, 64).await.unwrap();
	let b = RedisBus::connect(&url, &prefix, 64).await.unwrap();
	let mut rx = b.subscribe();

	let alice = ident("alice");
	let envelope = BusEnvelope {
		origin: "server-a".into(),
		event: LifecycleEvent::User {
			action: UserAction::Connected,
			user_id: alice.user_id,
			username: alice.username,
		},
	};

	// The subscriber attaches in the background; republish until it is listening.
	let got = timeout(Duration::from_secs(5), async {
		loop {
			a.publish(envelope.clone()).await.unwrap();
			if let Ok(Ok(ev)) = timeout(Duration::from_millis(200), rx.recv()).await {
				return ev;
			}
		}
	})
	.await
	.expect("event delivered over redis");

	assert_eq!(got, envelope);
}
