#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clash_domain::{DEFAULT_GAME_LENGTH_SECONDS, PuzzleId};
use clash_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.clash/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".clash").join("config.toml"))
}

/// Load the server config from TOML at `path` and apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub coordination: CoordinationSettings,
	pub lobby: LobbySettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Process identity stamped on presence and bus envelopes.
	pub server_id: Option<String>,
	pub heartbeat_interval: Duration,
	pub heartbeat_timeout: Duration,
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			server_id: None,
			heartbeat_interval: Duration::from_secs(30),
			heartbeat_timeout: Duration::from_secs(35),
			max_frame_bytes: clash_protocol::MAX_FRAME_BYTES,
			outbound_queue_capacity: 256,
		}
	}
}

/// Shared store and bus settings.
#[derive(Debug, Clone)]
pub struct CoordinationSettings {
	/// `redis://` URL; unset runs a single process with in-memory state.
	pub redis_url: Option<String>,
	pub key_prefix: String,
	pub presence_ttl: Duration,
	pub reap_interval: Duration,
}

impl Default for CoordinationSettings {
	fn default() -> Self {
		Self {
			redis_url: None,
			key_prefix: "clash".to_string(),
			presence_ttl: Duration::from_secs(90),
			reap_interval: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone)]
pub struct LobbySettings {
	pub max_players: u32,
	/// Age after which an unfinished start claim may be taken over.
	pub start_lease: Duration,
	pub game_length: Duration,
	pub session_url_prefix: String,
}

impl Default for LobbySettings {
	fn default() -> Self {
		Self {
			max_players: 8,
			start_lease: Duration::from_secs(30),
			game_length: Duration::from_secs(DEFAULT_GAME_LENGTH_SECONDS),
			session_url_prefix: "/session/".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Persist game sessions in a SQL database instead of memory.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
	/// Puzzle ids marked approved at startup, in whichever session store is active.
	pub seed_puzzles: Vec<PuzzleId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	coordination: FileCoordinationSettings,

	#[serde(default)]
	lobby: FileLobbySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	server_id: Option<String>,
	heartbeat_interval_secs: Option<u64>,
	heartbeat_timeout_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCoordinationSettings {
	redis_url: Option<String>,
	key_prefix: Option<String>,
	presence_ttl_secs: Option<u64>,
	reap_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLobbySettings {
	max_players: Option<u32>,
	start_lease_secs: Option<u64>,
	game_length_secs: Option<u64>,
	session_url_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	seed_puzzles: Option<Vec<String>>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let coordination_defaults = CoordinationSettings::default();
		let lobby_defaults = LobbySettings::default();

		let mut cfg = Self {
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				server_id: non_empty(file.server.server_id),
				heartbeat_interval: file
					.server
					.heartbeat_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.heartbeat_interval),
				heartbeat_timeout: file
					.server
					.heartbeat_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.heartbeat_timeout),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.outbound_queue_capacity),
			},
			coordination: CoordinationSettings {
				redis_url: non_empty(file.coordination.redis_url),
				key_prefix: non_empty(file.coordination.key_prefix).unwrap_or(coordination_defaults.key_prefix),
				presence_ttl: file
					.coordination
					.presence_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(coordination_defaults.presence_ttl),
				reap_interval: file
					.coordination
					.reap_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(coordination_defaults.reap_interval),
			},
			lobby: LobbySettings {
				max_players: file
					.lobby
					.max_players
					.filter(|v| *v > 0)
					.unwrap_or(lobby_defaults.max_players),
				start_lease: file
					.lobby
					.start_lease_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(lobby_defaults.start_lease),
				game_length: file
					.lobby
					.game_length_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(lobby_defaults.game_length),
				session_url_prefix: non_empty(file.lobby.session_url_prefix)
					.unwrap_or(lobby_defaults.session_url_prefix),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
				seed_puzzles: parse_puzzle_ids(file.persistence.seed_puzzles.unwrap_or_default()),
			},
		};

		cfg.normalize();
		cfg
	}

	fn normalize(&mut self) {
		if self.server.heartbeat_timeout <= self.server.heartbeat_interval {
			let fixed = self.server.heartbeat_interval + Duration::from_secs(5);
			warn!(
				interval_secs = self.server.heartbeat_interval.as_secs(),
				timeout_secs = self.server.heartbeat_timeout.as_secs(),
				"server config: heartbeat_timeout must exceed heartbeat_interval; raising it"
			);
			self.server.heartbeat_timeout = fixed;
		}

		if self.coordination.presence_ttl <= self.server.heartbeat_interval {
			warn!(
				ttl_secs = self.coordination.presence_ttl.as_secs(),
				"coordination config: presence_ttl is not longer than the heartbeat interval; presence may expire for live users"
			);
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn env_string(key: &str) -> Option<String> {
	non_empty(std::env::var(key).ok())
}

fn parse_puzzle_ids<I, S>(raw: I) -> Vec<PuzzleId>
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	raw.into_iter()
		.filter_map(|v| {
			let v = v.as_ref().trim();
			if v.is_empty() {
				return None;
			}
			match PuzzleId::new(v) {
				Ok(id) => Some(id),
				Err(e) => {
					warn!(puzzle = v, error = %e, "persistence: ignoring invalid seed puzzle id");
					None
				}
			}
		})
		.collect()
}

fn env_secs(key: &str) -> Option<Duration> {
	env_string(key)
		.and_then(|v| v.parse::<u64>().ok())
		.filter(|v| *v > 0)
		.map(Duration::from_secs)
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("CLASH_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_string("CLASH_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("CLASH_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("CLASH_SERVER_ID") {
		info!(server_id = %v, "server config: server_id overridden by env");
		cfg.server.server_id = Some(v);
	}

	if let Some(d) = env_secs("CLASH_HEARTBEAT_INTERVAL_SECS") {
		cfg.server.heartbeat_interval = d;
		info!(secs = d.as_secs(), "server config: heartbeat_interval overridden by env");
	}

	if let Some(d) = env_secs("CLASH_HEARTBEAT_TIMEOUT_SECS") {
		cfg.server.heartbeat_timeout = d;
		info!(secs = d.as_secs(), "server config: heartbeat_timeout overridden by env");
	}

	if let Some(v) = env_string("CLASH_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = env_string("CLASH_REDIS_URL") {
		cfg.coordination.redis_url = Some(v);
		info!("coordination: redis_url overridden by env");
	}

	if let Some(v) = env_string("CLASH_KEY_PREFIX") {
		info!(prefix = %v, "coordination: key_prefix overridden by env");
		cfg.coordination.key_prefix = v;
	}

	if let Some(d) = env_secs("CLASH_PRESENCE_TTL_SECS") {
		cfg.coordination.presence_ttl = d;
		info!(secs = d.as_secs(), "coordination: presence_ttl overridden by env");
	}

	if let Some(d) = env_secs("CLASH_REAP_INTERVAL_SECS") {
		cfg.coordination.reap_interval = d;
		info!(secs = d.as_secs(), "coordination: reap_interval overridden by env");
	}

	if let Some(v) = env_string("CLASH_MAX_PLAYERS")
		&& let Ok(max) = v.parse::<u32>()
		&& max > 0
	{
		cfg.lobby.max_players = max;
		info!(max, "lobby: max_players overridden by env");
	}

	if let Some(d) = env_secs("CLASH_START_LEASE_SECS") {
		cfg.lobby.start_lease = d;
		info!(secs = d.as_secs(), "lobby: start_lease overridden by env");
	}

	if let Some(d) = env_secs("CLASH_GAME_LENGTH_SECS") {
		cfg.lobby.game_length = d;
		info!(secs = d.as_secs(), "lobby: game_length overridden by env");
	}

	if let Some(v) = env_string("CLASH_SESSION_URL_PREFIX") {
		cfg.lobby.session_url_prefix = v;
		info!("lobby: session_url_prefix overridden by env");
	}

	if let Ok(v) = std::env::var("CLASH_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("CLASH_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("CLASH_PERSISTENCE_SEED_PUZZLES") {
		cfg.persistence.seed_puzzles = parse_puzzle_ids(v.split(','));
		info!(count = cfg.persistence.seed_puzzles.len(), "persistence: seed_puzzles overridden by env");
	}

	cfg.normalize();
}
