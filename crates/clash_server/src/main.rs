#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clash_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::auth::HmacAuthenticator;
use crate::server::bus::{DEFAULT_BUS_CAPACITY, EventBus, LocalBus};
use crate::server::connection::{CLOSE_GOING_AWAY, ConnectionSettings, ServerContext, serve};
use crate::server::dispatcher::Dispatcher;
use crate::server::game_channel::GameChannel;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::redis_bus::RedisBus;
use crate::server::redis_store::RedisStore;
use crate::server::registry::ConnectionRegistry;
use crate::server::rooms::{RoomConfig, RoomManager};
use crate::server::router::{spawn_dead_connection_sweeper, spawn_event_router, spawn_presence_reaper};
use crate::server::session_db::SqlSessionStore;
use crate::server::session_hub::SessionHub;
use crate::server::sessions::{GameSessionInitiator, MemorySessionStore, SessionDefaults, SessionStore};
use crate::server::store::{CoordinationStore, MemoryStore};

const DEFAULT_BIND: &str = "ws://127.0.0.1:18300";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: clash_server [--bind ws://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: {DEFAULT_BIND})\n\
\t          Format: ws://host:port\n\
\t--config   Config file (default: ~/.clash/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind = bind.to_socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, config }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,clash_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("clash_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn coordination_backends(cfg: &ServerConfig) -> anyhow::Result<(Arc<dyn CoordinationStore>, Arc<dyn EventBus>)> {
	let coord = &cfg.coordination;
	match coord.redis_url.as_deref() {
		Some(url) => {
			let store = RedisStore::connect(url, &coord.key_prefix, coord.presence_ttl).await?;
			let bus = RedisBus::connect(url, &coord.key_prefix, DEFAULT_BUS_CAPACITY).await?;
			info!(prefix = %coord.key_prefix, "using redis coordination store and event bus");
			Ok((Arc::new(store), Arc::new(bus)))
		}
		None => {
			warn!("no coordination.redis_url configured; rooms are local to this process");
			Ok((
				Arc::new(MemoryStore::new(coord.presence_ttl)),
				Arc::new(LocalBus::new(DEFAULT_BUS_CAPACITY)),
			))
		}
	}
}

async fn session_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
	let seeds = &cfg.persistence.seed_puzzles;

	if !cfg.persistence.enabled {
		let store = MemorySessionStore::new();
		for id in seeds {
			store.add_approved_puzzle(id.clone());
		}
		if seeds.is_empty() {
			warn!("persistence disabled and no persistence.seed_puzzles configured; START_GAME will find no puzzles");
		} else {
			warn!(puzzles = seeds.len(), "persistence disabled; game sessions are kept in memory");
		}
		return Ok(Arc::new(store));
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow!("persistence enabled but no database_url configured"));
	};
	let store = SqlSessionStore::connect(database_url).await?;
	for id in seeds {
		store
			.seed_approved_puzzle(id)
			.await
			.with_context(|| format!("seed puzzle {id}"))?;
	}
	if !seeds.is_empty() {
		info!(puzzles = seeds.len(), "seeded approved puzzles");
	}
	Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let Some(secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow!(
			"server.auth_hmac_secret (or CLASH_SERVER_AUTH_HMAC_SECRET) is required to authenticate sockets"
		));
	};

	let server_id = server_cfg
		.server
		.server_id
		.clone()
		.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

	let (store, bus) = coordination_backends(&server_cfg).await?;
	let sessions = session_store(&server_cfg).await?;

	let initiator = GameSessionInitiator::new(
		Arc::clone(&sessions),
		SessionDefaults {
			game_length: server_cfg.lobby.game_length,
			url_prefix: server_cfg.lobby.session_url_prefix.clone(),
			..SessionDefaults::default()
		},
	);
	let rooms = RoomManager::new(
		Arc::clone(&store),
		Arc::clone(&bus),
		initiator,
		server_id.clone(),
		RoomConfig {
			max_players: server_cfg.lobby.max_players,
			start_lease: server_cfg.lobby.start_lease,
		},
	);

	let (registry, dead_rx) = ConnectionRegistry::new();
	let registry = Arc::new(registry);
	let dispatcher = Dispatcher::new(rooms, Arc::clone(&registry));
	let hub = SessionHub::new();

	spawn_event_router(dispatcher.clone(), bus.subscribe(), server_id.clone());
	spawn_dead_connection_sweeper(dispatcher.clone(), dead_rx);
	spawn_presence_reaper(dispatcher.clone(), server_cfg.coordination.reap_interval);

	let health_state = HealthState::new(Arc::clone(&store));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let ctx = Arc::new(ServerContext {
		dispatcher,
		game_channel: GameChannel::new(sessions, hub.clone()),
		authenticator: Arc::new(HmacAuthenticator::new(secret)),
		settings: ConnectionSettings {
			max_frame_bytes: server_cfg.server.max_frame_bytes,
			outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
			heartbeat_interval: server_cfg.server.heartbeat_interval,
			heartbeat_timeout: server_cfg.server.heartbeat_timeout,
		},
	});

	let listener = TcpListener::bind(args.bind)
		.await
		.with_context(|| format!("bind {}", args.bind))?;
	info!(bind = %args.bind, %server_id, "clash_server: websocket endpoint ready");
	health_state.mark_ready();

	tokio::select! {
		res = serve(listener, Arc::clone(&ctx)) => res?,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
		}
	}

	health_state.mark_not_ready();
	registry.close_all(CLOSE_GOING_AWAY, "Server shutting down");
	hub.close_all(CLOSE_GOING_AWAY, "Server shutting down").await;
	// Give writers a moment to flush close frames.
	tokio::time::sleep(Duration::from_millis(250)).await;

	Ok(())
}
