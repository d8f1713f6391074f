#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use clash_domain::{Identity, SessionId};
use clash_protocol::{GameResponse, LobbyResponse, MAX_FRAME_BYTES, check_frame_len};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::server::auth::{Authenticator, UpgradeRequest};
use crate::server::dispatcher::Dispatcher;
use crate::server::game_channel::{Attach, GameChannel, GamePeer};
use crate::server::registry::{ConnectionHandle, Outbound};

pub const LOBBY_PATH: &str = "/ws/lobby";
pub const SESSION_PATH_PREFIX: &str = "/ws/session/";

/// Policy violation close code used for failed authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 1008;
pub const CLOSE_SERVER_ERROR: u16 = 1011;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
	pub heartbeat_interval: Duration,
	/// No pong for this long closes the socket.
	pub heartbeat_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: MAX_FRAME_BYTES,
			outbound_queue_capacity: 256,
			heartbeat_interval: Duration::from_secs(30),
			heartbeat_timeout: Duration::from_secs(35),
		}
	}
}

/// Everything a socket task needs.
pub struct ServerContext {
	pub dispatcher: Dispatcher,
	pub game_channel: GameChannel,
	pub authenticator: Arc<dyn Authenticator>,
	pub settings: ConnectionSettings,
}

/// Which WebSocket surface the upgrade targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
	Lobby,
	Session(SessionId),
}

impl Endpoint {
	pub fn from_path(path: &str) -> Option<Self> {
		if path == LOBBY_PATH {
			return Some(Endpoint::Lobby);
		}
		let id = path.strip_prefix(SESSION_PATH_PREFIX)?;
		if id.contains('/') {
			return None;
		}
		SessionId::new(id).ok().map(Endpoint::Session)
	}
}

/// Accept sockets until the listener fails.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = listener.accept().await.context("accept tcp connection")?;
		metrics::counter!("clash_server_connections_total").increment(1);

		let ctx = Arc::clone(&ctx);
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, remote, ctx).await {
				debug!(%remote, error = %e, "connection handler exited with error");
			}
		});
	}
}

pub async fn handle_connection(stream: TcpStream, remote: SocketAddr, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
	let mut upgrade = UpgradeRequest::default();
	let capture = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
		upgrade = capture_upgrade(req);
		if Endpoint::from_path(&upgrade.path).is_none() {
			let mut resp = ErrorResponse::new(Some("Not Found".to_string()));
			*resp.status_mut() = StatusCode::NOT_FOUND;
			return Err(resp);
		}
		Ok(response)
	};

	let ws = tokio_tungstenite::accept_hdr_async(stream, capture)
		.await
		.context("websocket handshake")?;
	let Some(endpoint) = Endpoint::from_path(&upgrade.path) else {
		return Ok(());
	};

	let (sink, stream) = ws.split();
	let (tx, rx) = mpsc::channel::<Outbound>(ctx.settings.outbound_queue_capacity.max(1));
	let writer = spawn_writer(sink, rx);

	let identity = match ctx.authenticator.verify(&upgrade) {
		Ok(identity) => identity,
		Err(e) => {
			metrics::counter!("clash_server_auth_failures_total").increment(1);
			info!(%remote, path = %upgrade.path, error = %e, "rejecting unauthenticated socket");
			let _ = tx
				.send(Outbound::Close {
					code: CLOSE_UNAUTHORIZED,
					reason: "Unauthorized".to_string(),
				})
				.await;
			drop(tx);
			finish_writer(writer).await;
			return Ok(());
		}
	};

	let connection_id = uuid::Uuid::new_v4().to_string();
	info!(%remote, user = %identity, conn = %connection_id, path = %upgrade.path, "socket authenticated");

	let reader = SocketReader::new(stream, tx.clone(), &ctx.settings);
	match endpoint {
		Endpoint::Lobby => run_lobby(&ctx, reader, &identity, &connection_id, tx).await,
		Endpoint::Session(session_id) => {
			let peer = GamePeer {
				identity,
				session_id,
				connection_id,
			};
			run_game(&ctx, reader, &peer, tx).await;
		}
	}

	finish_writer(writer).await;
	Ok(())
}

async fn run_lobby(
	ctx: &ServerContext,
	mut reader: SocketReader,
	identity: &Identity,
	connection_id: &str,
	tx: mpsc::Sender<Outbound>,
) {
	let dispatcher = &ctx.dispatcher;
	let handle = ConnectionHandle::new(connection_id, tx.clone());
	if let Err(e) = dispatcher.on_connect(identity, handle).await {
		warn!(user = %identity, error = %e, "lobby connect failed");
		let _ = tx.try_send(Outbound::Close {
			code: CLOSE_SERVER_ERROR,
			reason: "Server error".to_string(),
		});
		return;
	}
	drop(tx);

	loop {
		match reader.next().await {
			ReadEvent::Text(text) => dispatcher.handle_text(identity, &text).await,
			ReadEvent::Pong => match dispatcher.rooms().touch(&identity.username).await {
				Ok(true) => {}
				Ok(false) => {
					// Presence expired under a live socket; restore it.
					debug!(user = %identity, "presence expired while connected; re-registering");
					if let Err(e) = dispatcher.rooms().connect(identity, connection_id).await {
						warn!(user = %identity, error = %e, "failed to restore presence");
					}
				}
				Err(e) => warn!(user = %identity, error = %e, "presence refresh failed"),
			},
			ReadEvent::Rejected(message) => {
				dispatcher
					.registry()
					.send(&identity.username, &LobbyResponse::error(message));
			}
			ReadEvent::Closed => break,
		}
	}

	dispatcher.on_disconnect(&identity.username, connection_id).await;
	debug!(user = %identity, conn = connection_id, "lobby socket closed");
}

async fn run_game(ctx: &ServerContext, mut reader: SocketReader, peer: &GamePeer, tx: mpsc::Sender<Outbound>) {
	let channel = &ctx.game_channel;
	match channel.on_connect(peer, tx.clone()).await {
		Ok(Attach::Attached) => {}
		Ok(Attach::Rejected) => return,
		Err(e) => {
			warn!(session = %peer.session_id, user = %peer.identity, error = %e, "game connect failed");
			let _ = tx.try_send(Outbound::Close {
				code: CLOSE_SERVER_ERROR,
				reason: "Server error".to_string(),
			});
			return;
		}
	}
	drop(tx);

	loop {
		match reader.next().await {
			ReadEvent::Text(text) => channel.handle_text(peer, &text).await,
			ReadEvent::Pong => {}
			ReadEvent::Rejected(message) => {
				channel
					.hub()
					.send_to(&peer.session_id, &peer.identity.username, &GameResponse::error(message))
					.await;
			}
			ReadEvent::Closed => break,
		}
	}

	channel.on_disconnect(peer).await;
	debug!(session = %peer.session_id, user = %peer.identity, "game socket closed");
}

fn capture_upgrade(req: &Request) -> UpgradeRequest {
	let header = |name: &str| {
		req.headers()
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
	};

	UpgradeRequest {
		path: req.uri().path().to_string(),
		query: req.uri().query().map(str::to_string),
		authorization: header("authorization"),
		cookie: header("cookie"),
	}
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Drain the outbound queue into the socket. A `Close` item ends the writer.
fn spawn_writer(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			let (msg, last) = match item {
				Outbound::Text(text) => (Message::text(text), false),
				Outbound::Ping => (Message::Ping(Bytes::new()), false),
				Outbound::Close { code, reason } => (
					Message::Close(Some(CloseFrame {
						code: CloseCode::from(code),
						reason: reason.into(),
					})),
					true,
				),
			};

			if sink.send(msg).await.is_err() || last {
				break;
			}
		}
		let _ = sink.close().await;
	})
}

async fn finish_writer(writer: JoinHandle<()>) {
	// Remaining senders (hub or registry clones) may outlive the socket briefly.
	if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
		debug!("writer did not drain in time");
	}
}

enum ReadEvent {
	Text(String),
	Pong,
	/// Frame refused before parsing; the reason goes back as an error frame.
	Rejected(String),
	Closed,
}

/// Inbound half of a socket plus the ping/pong heartbeat.
struct SocketReader {
	stream: WsStream,
	tx: mpsc::Sender<Outbound>,
	ticker: tokio::time::Interval,
	last_pong: Instant,
	timeout: Duration,
	max_frame_bytes: usize,
}

impl SocketReader {
	fn new(stream: WsStream, tx: mpsc::Sender<Outbound>, settings: &ConnectionSettings) -> Self {
		let start = tokio::time::Instant::now() + settings.heartbeat_interval;
		let mut ticker = tokio::time::interval_at(start, settings.heartbeat_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		Self {
			stream,
			tx,
			ticker,
			last_pong: Instant::now(),
			timeout: settings.heartbeat_timeout,
			max_frame_bytes: settings.max_frame_bytes,
		}
	}

	async fn next(&mut self) -> ReadEvent {
		loop {
			tokio::select! {
				_ = self.ticker.tick() => {
					if self.last_pong.elapsed() > self.timeout {
						metrics::counter!("clash_server_heartbeat_timeouts_total").increment(1);
						debug!("heartbeat timed out");
						return ReadEvent::Closed;
					}
					if self.tx.try_send(Outbound::Ping).is_err() {
						return ReadEvent::Closed;
					}
				}
				msg = self.stream.next() => {
					let msg = match msg {
						Some(Ok(m)) => m,
						Some(Err(e)) => {
							debug!(error = %e, "websocket read failed");
							return ReadEvent::Closed;
						}
						None => return ReadEvent::Closed,
					};

					// Any inbound traffic proves liveness.
					self.last_pong = Instant::now();
					match msg {
						Message::Text(text) => {
							if let Err(e) = check_frame_len(text.len(), self.max_frame_bytes) {
								metrics::counter!("clash_server_frames_rejected_total", "reason" => "too_large").increment(1);
								return ReadEvent::Rejected(e.to_string());
							}
							metrics::counter!("clash_server_frames_in_total").increment(1);
							return ReadEvent::Text(text.as_str().to_string());
						}
						Message::Binary(_) => {
							metrics::counter!("clash_server_frames_rejected_total", "reason" => "binary").increment(1);
							return ReadEvent::Rejected("binary frames are not supported".to_string());
						}
						Message::Pong(_) => return ReadEvent::Pong,
						Message::Close(_) => return ReadEvent::Closed,
						Message::Ping(_) | Message::Frame(_) => {}
					}
				}
			}
		}
	}
}
