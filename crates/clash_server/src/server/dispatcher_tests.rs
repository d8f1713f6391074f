#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::server::bus::LocalBus;
use crate::server::dispatcher::{NO_PUZZLES, NOT_IN_ROOM, ROOM_NOT_FOUND};
use crate::server::sessions::MemorySessionStore;
use crate::server::store::CoordinationStore;
use crate::server::testkit::{TestClient, memory_store, node, sessions_with_puzzle};

fn room_with_players(v: &Value, room_id: &Value, count: u64) -> bool {
	v["event"] == "ROOMS_UPDATE"
		&& v["rooms"]
			.as_array()
			.is_some_and(|rooms| rooms.iter().any(|r| &r["roomId"] == room_id && r["playerCount"] == count))
}

fn rooms_empty(v: &Value) -> bool {
	v["event"] == "ROOMS_UPDATE" && v["rooms"].as_array().is_some_and(|r| r.is_empty())
}

#[tokio::test]
async fn connect_sends_initial_snapshot() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;

	let v = alice.expect_event("ROOMS_UPDATE").await;
	assert_eq!(v["rooms"], json!([]));
}

#[tokio::test]
async fn host_replies_and_refreshes_every_lobby() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let mut bob = TestClient::connect(&d, "bob").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;

	let created = alice.expect_event("ROOM_CREATED").await;
	let room_id = created["roomId"].clone();
	assert!(room_id.is_string());

	let update = bob
		.expect_matching("rooms update with the new room", |v| room_with_players(v, &room_id, 1))
		.await;
	assert_eq!(update["rooms"][0]["ownerUsername"], "alice");
	assert_eq!(update["rooms"][0]["maxPlayers"], 8);
	assert_eq!(update["rooms"][0]["players"], json!(["alice"]));
}

#[tokio::test]
async fn join_variants() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let mut bob = TestClient::connect(&d, "bob").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();

	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	assert_eq!(bob.expect_event("ROOM_JOINED").await["roomId"], room_id);
	alice
		.expect_matching("two players", |v| room_with_players(v, &room_id, 2))
		.await;

	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	assert_eq!(bob.expect_event("ALREADY_JOINED").await["roomId"], room_id);

	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": "nope"})).await;
	assert_eq!(bob.expect_event("JOIN_FAILED").await["roomId"], "nope");
}

#[tokio::test]
async fn leave_variants() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let mut bob = TestClient::connect(&d, "bob").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();
	bob.expect_matching("hosted room", |v| room_with_players(v, &room_id, 1))
		.await;

	bob.send(&d, json!({"event": "LEAVE_ROOM", "roomId": room_id})).await;
	assert_eq!(bob.expect_event("LEAVE_FAILED").await["roomId"], room_id);

	alice.send(&d, json!({"event": "LEAVE_ROOM", "roomId": room_id})).await;
	assert_eq!(alice.expect_event("ROOM_LEFT").await["roomId"], room_id);
	bob.expect_matching("empty listing", rooms_empty).await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_get_error() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;

	d.handle_text(&alice.identity, "{not json").await;
	alice.expect_event("ERROR").await;

	alice.send(&d, json!({"event": "SELF_DESTRUCT"})).await;
	let v = alice.expect_event("ERROR").await;
	assert!(v["message"].as_str().unwrap().contains("SELF_DESTRUCT"));

	alice.send(&d, json!({"event": "HOST_ROOM", "roomId": "x"})).await;
	alice.expect_event("ERROR").await;
	alice.expect_no_event("ROOM_CREATED").await;
}

#[tokio::test]
async fn start_without_puzzles_fails_and_keeps_room() {
	let store = memory_store();
	let d = node("s1", store.clone(), &LocalBus::default(), Arc::new(MemorySessionStore::new()));
	let mut alice = TestClient::connect(&d, "alice").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();

	alice.send(&d, json!({"event": "START_GAME", "roomId": room_id})).await;
	let v = alice.expect_event("START_GAME_FAILED").await;
	assert_eq!(v["roomId"], room_id);
	assert_eq!(v["error"], NO_PUZZLES);

	assert_eq!(store.list_rooms().await.unwrap().len(), 1);
	alice.expect_no_event("START_GAME").await;
}

#[tokio::test]
async fn start_failures_carry_specific_errors() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let mut bob = TestClient::connect(&d, "bob").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();

	bob.send(&d, json!({"event": "START_GAME", "roomId": room_id})).await;
	assert_eq!(bob.expect_event("START_GAME_FAILED").await["error"], NOT_IN_ROOM);

	bob.send(&d, json!({"event": "START_GAME", "roomId": "gone"})).await;
	assert_eq!(bob.expect_event("START_GAME_FAILED").await["error"], ROOM_NOT_FOUND);
}

#[tokio::test]
async fn start_redirects_every_player() {
	let sessions = sessions_with_puzzle();
	let d = node("s1", memory_store(), &LocalBus::default(), sessions.clone());
	let mut alice = TestClient::connect(&d, "alice").await;
	let mut bob = TestClient::connect(&d, "bob").await;
	let mut carol = TestClient::connect(&d, "carol").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();
	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	bob.expect_event("ROOM_JOINED").await;
	carol
		.expect_matching("room listed", |v| room_with_players(v, &room_id, 2))
		.await;

	alice.send(&d, json!({"event": "START_GAME", "roomId": room_id})).await;

	let session_id = sessions.sessions()[0].session_id.to_string();
	for client in [&mut alice, &mut bob] {
		let v = client.expect_event("START_GAME").await;
		assert_eq!(v["gameUrl"], format!("/session/{session_id}"));
	}
	carol.expect_matching("room gone", rooms_empty).await;
	carol.expect_no_event("START_GAME").await;
}

#[tokio::test]
async fn room_chat_reaches_members_only() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let mut bob = TestClient::connect(&d, "bob").await;
	let mut carol = TestClient::connect(&d, "carol").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();
	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	bob.expect_event("ROOM_JOINED").await;

	alice
		.send(&d, json!({"event": "CHAT_MESSAGE", "roomId": room_id, "text": "ready?"}))
		.await;
	for client in [&mut alice, &mut bob] {
		let v = client.expect_event("CHAT_MESSAGE").await;
		assert_eq!(v["username"], "alice");
		assert_eq!(v["text"], "ready?");
		assert_eq!(v["roomId"], room_id);
	}
	carol.expect_no_event("CHAT_MESSAGE").await;

	carol
		.send(&d, json!({"event": "CHAT_MESSAGE", "roomId": room_id, "text": "let me in"}))
		.await;
	assert_eq!(carol.expect_event("CHAT_FAILED").await["roomId"], room_id);
}

#[tokio::test]
async fn disconnect_removes_member_and_refreshes_lobby() {
	let d = node("s1", memory_store(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let bob = TestClient::connect(&d, "bob").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();
	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	alice
		.expect_matching("two players", |v| room_with_players(v, &room_id, 2))
		.await;

	d.on_disconnect(&bob.identity.username, &bob.connection_id).await;

	alice
		.expect_matching("back to one player", |v| room_with_players(v, &room_id, 1))
		.await;
	assert!(!d.registry().contains(&bob.identity.username));
}

#[tokio::test]
async fn dead_socket_is_swept() {
	let store = memory_store();
	let d = node("s1", store.clone(), &LocalBus::default(), sessions_with_puzzle());
	let mut alice = TestClient::connect(&d, "alice").await;
	let bob = TestClient::connect(&d, "bob").await;

	alice.send(&d, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();
	bob.send(&d, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	alice
		.expect_matching("two players", |v| room_with_players(v, &room_id, 2))
		.await;

	drop(bob);
	// The next broadcast discovers bob's writer is gone.
	d.broadcast_rooms().await;

	alice
		.expect_matching("sweeper removed bob", |v| room_with_players(v, &room_id, 1))
		.await;
}

#[tokio::test]
async fn two_processes_share_rooms_through_store_and_bus() {
	let store = memory_store();
	let bus = LocalBus::default();
	let sessions = sessions_with_puzzle();
	let a = node("server-a", store.clone(), &bus, sessions.clone());
	let b = node("server-b", store.clone(), &bus, sessions.clone());

	let mut alice = TestClient::connect(&a, "alice").await;
	let mut bob = TestClient::connect(&b, "bob").await;

	alice.send(&a, json!({"event": "HOST_ROOM"})).await;
	let room_id = alice.expect_event("ROOM_CREATED").await["roomId"].clone();

	// Bob's process learns about the room from the bus.
	bob.expect_matching("remote room", |v| room_with_players(v, &room_id, 1))
		.await;

	bob.send(&b, json!({"event": "JOIN_ROOM", "roomId": room_id})).await;
	bob.expect_event("ROOM_JOINED").await;
	alice
		.expect_matching("remote join", |v| room_with_players(v, &room_id, 2))
		.await;

	alice.send(&a, json!({"event": "START_GAME", "roomId": room_id})).await;
	let a_url = alice.expect_event("START_GAME").await["gameUrl"].clone();
	let b_url = bob.expect_event("START_GAME").await["gameUrl"].clone();
	assert_eq!(a_url, b_url);
	assert_eq!(sessions.session_count(), 1);

	bob.expect_matching("room gone on b", rooms_empty).await;
	tokio::time::sleep(Duration::from_millis(10)).await;
	assert!(store.list_rooms().await.unwrap().is_empty());
}
