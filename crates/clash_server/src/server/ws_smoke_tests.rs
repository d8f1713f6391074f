#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clash_util::SecretString;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::server::auth::{AuthClaims, HmacAuthenticator, mint_hmac_token};
use crate::server::bus::LocalBus;
use crate::server::connection::{ConnectionSettings, ServerContext, serve};
use crate::server::game_channel::GameChannel;
use crate::server::session_hub::SessionHub;
use crate::server::testkit::{memory_store, node, sessions_with_puzzle};

const SECRET: &str = "smoke-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
	let sessions = sessions_with_puzzle();
	let dispatcher = node("smoke", memory_store(), &LocalBus::default(), sessions.clone());
	let ctx = Arc::new(ServerContext {
		dispatcher,
		game_channel: GameChannel::new(sessions, SessionHub::new()),
		authenticator: Arc::new(HmacAuthenticator::new(SecretString::new(SECRET))),
		settings: ConnectionSettings::default(),
	});

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(serve(listener, ctx));
	addr
}

fn token(user: &str) -> String {
	let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
	mint_hmac_token(
		&AuthClaims {
			sub: format!("u-{user}"),
			name: user.to_string(),
			exp,
		},
		SECRET,
	)
	.unwrap()
}

async fn connect_with_bearer(addr: SocketAddr, path: &str, bearer: Option<&str>) -> Client {
	let mut req = format!("ws://{addr}{path}").into_client_request().unwrap();
	if let Some(t) = bearer {
		req.headers_mut()
			.insert("authorization", HeaderValue::from_str(&format!("Bearer {t}")).unwrap());
	}
	let (ws, _resp) = tokio_tungstenite::connect_async(req).await.unwrap();
	ws
}

async fn next_json(ws: &mut Client) -> Value {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("valid frame");
		match msg {
			Message::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => panic!("expected text, got {other:?}"),
		}
	}
}

async fn next_close_code(ws: &mut Client) -> Option<CloseCode> {
	loop {
		match timeout(Duration::from_secs(2), ws.next()).await.expect("frame within timeout") {
			Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
			Some(Ok(_)) => continue,
			Some(Err(_)) | None => return None,
		}
	}
}

#[tokio::test]
async fn lobby_round_trip_over_websocket() {
	let addr = start_server().await;
	let mut ws = connect_with_bearer(addr, "/ws/lobby", Some(&token("alice"))).await;

	let snapshot = next_json(&mut ws).await;
	assert_eq!(snapshot["event"], "ROOMS_UPDATE");

	ws.send(Message::text(json!({"event": "HOST_ROOM"}).to_string()))
		.await
		.unwrap();

	let mut saw_created = false;
	for _ in 0..3 {
		let v = next_json(&mut ws).await;
		if v["event"] == "ROOM_CREATED" {
			saw_created = true;
			break;
		}
	}
	assert!(saw_created);
}

#[tokio::test]
async fn missing_token_closes_with_policy_violation() {
	let addr = start_server().await;
	let mut ws = connect_with_bearer(addr, "/ws/lobby", None).await;

	assert_eq!(next_close_code(&mut ws).await, Some(CloseCode::Policy));
}

#[tokio::test]
async fn forged_token_is_rejected() {
	let addr = start_server().await;
	let forged = mint_hmac_token(
		&AuthClaims {
			sub: "u-mallory".into(),
			name: "mallory".into(),
			exp: u64::MAX,
		},
		"wrong-secret",
	)
	.unwrap();
	let mut ws = connect_with_bearer(addr, "/ws/lobby", Some(&forged)).await;

	assert_eq!(next_close_code(&mut ws).await, Some(CloseCode::Policy));
}

#[tokio::test]
async fn token_in_query_is_accepted() {
	let addr = start_server().await;
	let path = format!("/ws/lobby?token={}", token("bob"));
	let mut ws = connect_with_bearer(addr, &path, None).await;

	assert_eq!(next_json(&mut ws).await["event"], "ROOMS_UPDATE");
}

#[tokio::test]
async fn unknown_path_is_refused_during_handshake() {
	let addr = start_server().await;
	let req = format!("ws://{addr}/nope").into_client_request().unwrap();
	assert!(tokio_tungstenite::connect_async(req).await.is_err());
}

#[tokio::test]
async fn unknown_session_reports_and_closes() {
	let addr = start_server().await;
	let mut ws = connect_with_bearer(addr, "/ws/session/does-not-exist", Some(&token("alice"))).await;

	assert_eq!(next_json(&mut ws).await["event"], "NONEXISTENT_GAME");
	assert_eq!(next_close_code(&mut ws).await, Some(CloseCode::Normal));
}

#[tokio::test]
async fn oversized_frame_gets_error_not_disconnect() {
	let addr = start_server().await;
	let mut ws = connect_with_bearer(addr, "/ws/lobby", Some(&token("carol"))).await;
	next_json(&mut ws).await;

	let huge = "x".repeat(ConnectionSettings::default().max_frame_bytes + 1);
	ws.send(Message::text(huge)).await.unwrap();
	let v = next_json(&mut ws).await;
	assert_eq!(v["event"], "ERROR");
	assert!(v["message"].as_str().unwrap().contains("too large"));

	ws.send(Message::text(json!({"event": "HOST_ROOM"}).to_string()))
		.await
		.unwrap();
	assert_eq!(next_json(&mut ws).await["event"], "ROOM_CREATED");
}
