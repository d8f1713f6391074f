use clash_domain::{Identity, Room, RoomId, Username};
use clash_protocol::{LobbyRequest, LobbyResponse, MAX_CHAT_CHARS, ProtocolError, RoomSummary, check_frame_len};
use proptest::prelude::*;
use serde_json::json;

fn room_id(s: &str) -> RoomId {
	RoomId::new(s).expect("valid room id")
}

#[test]
fn parses_every_lobby_event() {
	assert_eq!(LobbyRequest::parse(r#"{"event":"HOST_ROOM"}"#).unwrap(), LobbyRequest::HostRoom);
	assert_eq!(
		LobbyRequest::parse(r#"{"event":"JOIN_ROOM","roomId":"R1"}"#).unwrap(),
		LobbyRequest::JoinRoom { room_id: room_id("R1") }
	);
	assert_eq!(
		LobbyRequest::parse(r#"{"roomId":"R1","event":"LEAVE_ROOM"}"#).unwrap(),
		LobbyRequest::LeaveRoom { room_id: room_id("R1") }
	);
	assert_eq!(
		LobbyRequest::parse(r#"{"event":"START_GAME","roomId":"R1"}"#).unwrap(),
		LobbyRequest::StartGame { room_id: room_id("R1") }
	);
	assert_eq!(
		LobbyRequest::parse(r#"{"event":"CHAT_MESSAGE","roomId":"R1","text":"gl hf"}"#).unwrap(),
		LobbyRequest::ChatMessage {
			room_id: room_id("R1"),
			text: "gl hf".into()
		}
	);
}

#[test]
fn host_room_rejects_extra_fields() {
	let err = LobbyRequest::parse(r#"{"event":"HOST_ROOM","roomId":"R1"}"#).unwrap_err();
	assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == "HOST_ROOM"));
}

#[test]
fn join_room_requires_room_id() {
	let err = LobbyRequest::parse(r#"{"event":"JOIN_ROOM"}"#).unwrap_err();
	assert!(matches!(err, ProtocolError::InvalidPayload { .. }));

	let err = LobbyRequest::parse(r#"{"event":"JOIN_ROOM","roomId":""}"#).unwrap_err();
	assert!(matches!(err, ProtocolError::InvalidPayload { .. }));

	let err = LobbyRequest::parse(r#"{"event":"JOIN_ROOM","roomId":42}"#).unwrap_err();
	assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
}

#[test]
fn rejects_non_object_and_missing_event() {
	assert!(matches!(LobbyRequest::parse("not json"), Err(ProtocolError::Malformed(_))));
	assert_eq!(LobbyRequest::parse("[1,2]"), Err(ProtocolError::NotAnObject));
	assert_eq!(LobbyRequest::parse(r#"{"roomId":"R1"}"#), Err(ProtocolError::MissingEvent));
	assert!(matches!(
		LobbyRequest::parse(r#"{"event":7}"#),
		Err(ProtocolError::InvalidPayload { .. })
	));
}

#[test]
fn chat_length_is_bounded() {
	let empty = json!({"event": "CHAT_MESSAGE", "roomId": "R1", "text": "   "}).to_string();
	assert!(LobbyRequest::parse(&empty).is_err());

	let max = json!({"event": "CHAT_MESSAGE", "roomId": "R1", "text": "é".repeat(MAX_CHAT_CHARS)}).to_string();
	assert!(LobbyRequest::parse(&max).is_ok());

	let over = json!({"event": "CHAT_MESSAGE", "roomId": "R1", "text": "a".repeat(MAX_CHAT_CHARS + 1)}).to_string();
	assert!(LobbyRequest::parse(&over).is_err());
}

#[test]
fn frame_len_limit() {
	assert!(check_frame_len(10, 10).is_ok());
	assert_eq!(
		check_frame_len(11, 10),
		Err(ProtocolError::FrameTooLarge { len: 11, max: 10 })
	);
}

#[test]
fn responses_use_event_tag_and_camel_case_fields() {
	let v = serde_json::to_value(LobbyResponse::RoomCreated { room_id: room_id("R1") }).unwrap();
	assert_eq!(v, json!({"event": "ROOM_CREATED", "roomId": "R1"}));

	let v = serde_json::to_value(LobbyResponse::JoinFailed {
		room_id: room_id("does-not-exist"),
	})
	.unwrap();
	assert_eq!(v, json!({"event": "JOIN_FAILED", "roomId": "does-not-exist"}));

	let v = serde_json::to_value(LobbyResponse::StartGame {
		game_url: "/session/abc".into(),
	})
	.unwrap();
	assert_eq!(v, json!({"event": "START_GAME", "gameUrl": "/session/abc"}));

	let v = serde_json::to_value(LobbyResponse::StartGameFailed {
		room_id: room_id("R1"),
		error: "nope".into(),
	})
	.unwrap();
	assert_eq!(v, json!({"event": "START_GAME_FAILED", "roomId": "R1", "error": "nope"}));

	let v = serde_json::to_value(LobbyResponse::error("bad frame")).unwrap();
	assert_eq!(v, json!({"event": "ERROR", "message": "bad frame"}));
}

#[test]
fn rooms_update_lists_summaries() {
	let alice = Identity::parse("u-alice", "alice").unwrap();
	let bob = Identity::parse("u-bob", "bob").unwrap();
	let mut room = Room::new(room_id("R1"), &alice, 4, 0);
	room.players.push((&bob).into());

	let v = serde_json::to_value(LobbyResponse::RoomsUpdate {
		rooms: vec![RoomSummary::from(&room)],
	})
	.unwrap();
	assert_eq!(
		v,
		json!({
			"event": "ROOMS_UPDATE",
			"rooms": [{
				"roomId": "R1",
				"ownerUsername": "alice",
				"playerCount": 2,
				"maxPlayers": 4,
				"players": ["alice", "bob"]
			}]
		})
	);
}

#[test]
fn chat_response_shape() {
	let v = serde_json::to_value(LobbyResponse::ChatMessage {
		room_id: room_id("R1"),
		username: Username::new("bob").unwrap(),
		text: "hi".into(),
		created_at: "2026-01-01T00:00:00.000Z".into(),
	})
	.unwrap();
	assert_eq!(
		v,
		json!({"event": "CHAT_MESSAGE", "roomId": "R1", "username": "bob", "text": "hi", "createdAt": "2026-01-01T00:00:00.000Z"})
	);
}

proptest! {
	#[test]
	fn unknown_events_are_rejected(name in "[A-Z_]{1,24}") {
		prop_assume!(!["HOST_ROOM", "JOIN_ROOM", "LEAVE_ROOM", "START_GAME", "CHAT_MESSAGE"].contains(&name.as_str()));
		let frame = json!({"event": name.clone(), "roomId": "R1"}).to_string();
		prop_assert_eq!(LobbyRequest::parse(&frame), Err(ProtocolError::UnknownEvent(name)));
	}

	#[test]
	fn extra_fields_are_rejected(field in "[a-z]{1,12}") {
		prop_assume!(field != "roomid");
		let mut frame = json!({"event": "JOIN_ROOM", "roomId": "R1"});
		frame[field.as_str()] = json!(true);
		let is_invalid = matches!(LobbyRequest::parse(&frame.to_string()), Err(ProtocolError::InvalidPayload { .. }));
		prop_assert!(is_invalid);
	}

	#[test]
	fn parser_never_panics(s in ".{0,256}") {
		let _ = LobbyRequest::parse(&s);
	}
}
