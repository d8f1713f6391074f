#![forbid(unsafe_code)]

use std::time::Duration;

use clash_domain::{Room, RoomId, RoomMember, RoomPhase, UserPresence};

use crate::server::store::{CoordinationStore, JoinResult, LeaveResult, MemoryStore, StartClaim};
use crate::server::testkit::ident;
use crate::util::time::unix_ms_now;

const LEASE: i64 = 30_000;

fn presence(name: &str, conn: &str) -> UserPresence {
	let id = ident(name);
	UserPresence {
		username: id.username,
		user_id: id.user_id,
		connection_id: conn.to_string(),
		server_id: "s1".to_string(),
		room_id: None,
		last_seen_ms: unix_ms_now(),
	}
}

/// Behavior every backend must share. Names are suffixed with `tag` so shared stores stay isolated.
pub(crate) async fn store_contract(store: &dyn CoordinationStore, tag: &str) {
	let host = ident(&format!("host-{tag}"));
	let guest = ident(&format!("guest-{tag}"));
	let third = ident(&format!("third-{tag}"));

	let room = Room::new(RoomId::generate(), &host, 2, unix_ms_now());
	let room_id = room.room_id.clone();
	store.set_room(&room).await.unwrap();

	assert_eq!(
		store.add_player(&room_id, &RoomMember::from(&host)).await.unwrap(),
		JoinResult::AlreadyJoined
	);
	match store.add_player(&room_id, &RoomMember::from(&guest)).await.unwrap() {
		JoinResult::Joined(r) => assert_eq!(r.player_ids(), vec![host.user_id.clone(), guest.user_id.clone()]),
		other => panic!("expected Joined, got {other:?}"),
	}
	assert_eq!(
		store.add_player(&room_id, &RoomMember::from(&third)).await.unwrap(),
		JoinResult::Full
	);
	assert_eq!(
		store.add_player(&RoomId::generate(), &RoomMember::from(&third)).await.unwrap(),
		JoinResult::NotFound
	);

	// Owner leaves: ownership moves to the remaining player.
	match store.remove_player(&room_id, &host.user_id, unix_ms_now(), LEASE).await.unwrap() {
		LeaveResult::Left(r) => {
			assert_eq!(r.owner_id, guest.user_id);
			assert_eq!(r.owner_username, guest.username);
			assert_eq!(r.player_count(), 1);
		}
		other => panic!("expected Left, got {other:?}"),
	}
	assert_eq!(
		store.remove_player(&room_id, &host.user_id, unix_ms_now(), LEASE).await.unwrap(),
		LeaveResult::NotMember
	);

	// Start claim is exclusive until released, and freezes the player set.
	let now = unix_ms_now();
	assert!(matches!(
		store.claim_start(&room_id, "claim-1", now, LEASE).await.unwrap(),
		StartClaim::Claimed(r) if r.phase == RoomPhase::Starting && r.start_token.as_deref() == Some("claim-1")
	));
	assert_eq!(
		store.claim_start(&room_id, "claim-2", now + 1, LEASE).await.unwrap(),
		StartClaim::InProgress
	);
	assert_eq!(
		store.add_player(&room_id, &RoomMember::from(&third)).await.unwrap(),
		JoinResult::Starting
	);
	assert_eq!(
		store.remove_player(&room_id, &guest.user_id, now + 2, LEASE).await.unwrap(),
		LeaveResult::Starting
	);
	assert!(!store.release_start(&room_id, "claim-2").await.unwrap());
	assert!(store.finish_start(&room_id, "claim-2").await.unwrap().is_none());
	assert!(store.release_start(&room_id, "claim-1").await.unwrap());
	assert_eq!(store.get_room(&room_id).await.unwrap().unwrap().phase, RoomPhase::Open);

	// Last player out deletes the room.
	assert_eq!(
		store.remove_player(&room_id, &guest.user_id, unix_ms_now(), LEASE).await.unwrap(),
		LeaveResult::Deleted
	);
	assert!(store.get_room(&room_id).await.unwrap().is_none());
	assert_eq!(
		store.remove_player(&room_id, &guest.user_id, unix_ms_now(), LEASE).await.unwrap(),
		LeaveResult::NotFound
	);

	// Finishing a held claim removes the room and hands back its final record.
	let room = Room::new(RoomId::generate(), &host, 4, unix_ms_now());
	store.set_room(&room).await.unwrap();
	store.add_player(&room.room_id, &RoomMember::from(&guest)).await.unwrap();
	store
		.claim_start(&room.room_id, "claim-3", unix_ms_now(), LEASE)
		.await
		.unwrap();
	let finished = store.finish_start(&room.room_id, "claim-3").await.unwrap().unwrap();
	assert_eq!(finished.player_ids(), vec![host.user_id.clone(), guest.user_id.clone()]);
	assert!(store.get_room(&room.room_id).await.unwrap().is_none());
	assert!(
		!store
			.list_rooms()
			.await
			.unwrap()
			.iter()
			.any(|r| r.room_id == room.room_id)
	);
	assert!(store.finish_start(&room.room_id, "claim-3").await.unwrap().is_none());

	// Presence deletion is conditional on the connection id.
	let p = presence(&format!("pres-{tag}"), "c1");
	store.set_presence(&p).await.unwrap();
	store.set_presence_room(&p.username, Some(&room_id)).await.unwrap();
	assert_eq!(
		store.get_presence(&p.username).await.unwrap().unwrap().room_id,
		Some(room_id.clone())
	);
	assert!(!store.delete_presence(&p.username, "c2").await.unwrap());
	assert!(store.touch_presence(&p.username, unix_ms_now()).await.unwrap());
	assert!(store.delete_presence(&p.username, "c1").await.unwrap());
	assert!(store.get_presence(&p.username).await.unwrap().is_none());
	assert!(!store.touch_presence(&p.username, unix_ms_now()).await.unwrap());
}

#[tokio::test]
async fn memory_store_contract() {
	let store = MemoryStore::new(Duration::from_secs(90));
	store_contract(&store, "mem").await;
}

#[tokio::test]
async fn stale_start_claim_can_be_reclaimed() {
	let store = MemoryStore::new(Duration::from_secs(90));
	let room = Room::new(RoomId::generate(), &ident("alice"), 8, 0);
	store.set_room(&room).await.unwrap();

	let now = unix_ms_now();
	assert!(matches!(
		store.claim_start(&room.room_id, "old", now - 60_000, LEASE).await.unwrap(),
		StartClaim::Claimed(_)
	));
	assert!(matches!(
		store.claim_start(&room.room_id, "new", now, LEASE).await.unwrap(),
		StartClaim::Claimed(_)
	));

	// The superseded claimant can neither release nor finish.
	assert!(!store.release_start(&room.room_id, "old").await.unwrap());
	assert!(store.finish_start(&room.room_id, "old").await.unwrap().is_none());
	assert!(store.get_room(&room.room_id).await.unwrap().unwrap().holds_start_claim("new"));
}

#[tokio::test]
async fn leaving_under_a_stale_claim_drops_the_claim() {
	let store = MemoryStore::new(Duration::from_secs(90));
	let alice = ident("alice");
	let bob = ident("bob");
	let room = Room::new(RoomId::generate(), &alice, 8, 0);
	store.set_room(&room).await.unwrap();
	store.add_player(&room.room_id, &RoomMember::from(&bob)).await.unwrap();

	let now = unix_ms_now();
	store
		.claim_start(&room.room_id, "abandoned", now - 60_000, LEASE)
		.await
		.unwrap();
	match store.remove_player(&room.room_id, &bob.user_id, now, LEASE).await.unwrap() {
		LeaveResult::Left(r) => {
			assert_eq!(r.phase, RoomPhase::Open);
			assert!(r.start_token.is_none());
		}
		other => panic!("expected Left, got {other:?}"),
	}
	assert!(store.finish_start(&room.room_id, "abandoned").await.unwrap().is_none());
}

#[tokio::test]
async fn presence_expires_after_ttl() {
	let store = MemoryStore::new(Duration::from_millis(50));
	let p = presence("alice", "c1");
	store.set_presence(&p).await.unwrap();
	assert!(store.get_presence(&p.username).await.unwrap().is_some());

	tokio::time::sleep(Duration::from_millis(80)).await;
	assert!(store.get_presence(&p.username).await.unwrap().is_none());
}

#[tokio::test]
async fn rooms_are_listed_oldest_first() {
	let store = MemoryStore::new(Duration::from_secs(90));
	let newer = Room::new(RoomId::new("b").unwrap(), &ident("bob"), 8, 2_000);
	let older = Room::new(RoomId::new("a").unwrap(), &ident("alice"), 8, 1_000);
	store.set_room(&newer).await.unwrap();
	store.set_room(&older).await.unwrap();

	let ids: Vec<String> = store
		.list_rooms()
		.await
		.unwrap()
		.into_iter()
		.map(|r| r.room_id.to_string())
		.collect();
	assert_eq!(ids, vec!["a", "b"]);
}
