use std::str::FromStr;
use std::time::Duration;

use log::{Level, debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

/// Runtime configuration for the sync engine.
///
/// Values are loaded from (in order): `/etc/backoffice/sync.json`, the user
/// config folder (optional), and environment variables prefixed with `BOS_`
/// (e.g. `BOS_MAX_QUEUE_SIZE`). Every knob is read at a cycle boundary, so a
/// reload published through [`SettingsWatch`] takes effect without restart.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Settings {
	/// Identifier of this device, used for idempotency keys and LAN frames.
	pub device_id: String,
	/// Directory backing the local durable store.
	pub store_dir: String,
	pub remote_base_url: Url,
	pub remote_timeout_ms: u64,
	pub log_level: Level,

	// Sync scheduler
	pub startup_delay_ms: u64,
	pub background_interval_ms: u64,
	pub item_process_delay_ms: u64,
	pub network_probe_interval_ms: u64,

	// Retry coordinator / queue
	pub retry_backoff_delays_ms: Vec<u64>,
	pub max_retries: u32,
	pub max_queue_size: usize,

	// Cache manager
	pub cache_ttl_default_hours: u64,
	pub cache_ttl_orders_hours: u64,
	pub cache_refresh_interval_hours: u64,

	// LAN peers
	pub lan_listen_port: u16,
	/// Statically known peers, formatted as `id@host:port`.
	pub lan_peers: Vec<String>,
	pub lan_heartbeat_interval_ms: u64,
	pub lan_stale_timeout_ms: u64,
	pub lan_max_reconnect_attempts: u32,
	pub lan_reconnect_backoff_base_ms: u64,
	pub lan_reconnect_backoff_max_ms: u64,

	// Status surface
	pub status_host: String,
	pub status_port: u16,
	pub config_reload_interval_ms: u64,
}

impl Default for Settings {
	fn default() -> Self {
		let device_id = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "pos-device".to_string());

		Self {
			device_id,
			store_dir: default_store_dir(),
			remote_base_url: Url::parse("http://127.0.0.1:54321/rest/v1/")
				.expect("static url is valid"),
			remote_timeout_ms: 10_000,
			log_level: Level::Info,
			startup_delay_ms: 5_000,
			background_interval_ms: 30_000,
			item_process_delay_ms: 100,
			network_probe_interval_ms: 15_000,
			// 5s -> 10s -> 30s -> 1min -> 5min
			retry_backoff_delays_ms: vec![5_000, 10_000, 30_000, 60_000, 300_000],
			max_retries: 5,
			max_queue_size: 500,
			cache_ttl_default_hours: 24,
			cache_ttl_orders_hours: 24 * 7,
			cache_refresh_interval_hours: 1,
			lan_listen_port: 8787,
			lan_peers: Vec::new(),
			lan_heartbeat_interval_ms: 30_000,
			lan_stale_timeout_ms: 60_000,
			lan_max_reconnect_attempts: 10,
			lan_reconnect_backoff_base_ms: 1_000,
			lan_reconnect_backoff_max_ms: 60_000,
			status_host: "127.0.0.1".to_string(),
			status_port: 8788,
			config_reload_interval_ms: 30_000,
		}
	}
}

fn default_store_dir() -> String {
	dirs::data_local_dir()
		.map(|d| d.join("backoffice").join("sync"))
		.unwrap_or_else(|| std::path::PathBuf::from("./data"))
		.to_string_lossy()
		.into_owned()
}

impl Settings {
	pub fn startup_delay(&self) -> Duration {
		Duration::from_millis(self.startup_delay_ms)
	}

	pub fn background_interval(&self) -> Duration {
		Duration::from_millis(self.background_interval_ms)
	}

	pub fn item_process_delay(&self) -> Duration {
		Duration::from_millis(self.item_process_delay_ms)
	}

	pub fn network_probe_interval(&self) -> Duration {
		Duration::from_millis(self.network_probe_interval_ms)
	}

	pub fn remote_timeout(&self) -> Duration {
		Duration::from_millis(self.remote_timeout_ms)
	}

	pub fn cache_refresh_interval(&self) -> Duration {
		Duration::from_secs(self.cache_refresh_interval_hours * 3600)
	}

	pub fn lan_heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.lan_heartbeat_interval_ms)
	}

	pub fn config_reload_interval(&self) -> Duration {
		Duration::from_millis(self.config_reload_interval_ms)
	}

	/// Reject combinations the engine cannot run with.
	pub fn validate(&self) -> Result<(), SettingsError> {
		if self.retry_backoff_delays_ms.is_empty() {
			return Err(SettingsError::Invalid(
				"retry_backoff_delays_ms must contain at least one delay".into(),
			));
		}
		if self.max_queue_size == 0 {
			return Err(SettingsError::Invalid("max_queue_size must be positive".into()));
		}
		if self.background_interval_ms == 0
			|| self.lan_heartbeat_interval_ms == 0
			|| self.cache_refresh_interval_hours == 0
		{
			return Err(SettingsError::Invalid("timer intervals must be positive".into()));
		}
		if let Some(bad) = self
			.lan_peers
			.iter()
			.find(|p| crate::lan::parse_peer_spec(p).is_err())
		{
			return Err(SettingsError::Invalid(format!(
				"lan_peers entry {:?} is not id@host:port",
				bad
			)));
		}
		if self.lan_reconnect_backoff_base_ms > self.lan_reconnect_backoff_max_ms {
			return Err(SettingsError::Invalid(
				"lan_reconnect_backoff_base_ms exceeds lan_reconnect_backoff_max_ms".into(),
			));
		}
		if self.device_id.trim().is_empty() {
			return Err(SettingsError::Invalid("device_id must not be empty".into()));
		}
		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/backoffice/sync.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("backoffice").join("sync.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("BOS")
			.separator("__")
			.list_separator(",")
			.with_list_parse_key("retry_backoff_delays_ms")
			.with_list_parse_key("lan_peers")
			.try_parsing(true),
	);

	let cfg = builder.build()?;
	let mut s: Settings = cfg.try_deserialize()?;

	// Direct environment variables win over everything else; some harnesses
	// set them in ways the layered source does not map.
	env_override("BOS_DEVICE_ID", &mut s.device_id);
	env_override("BOS_STORE_DIR", &mut s.store_dir);
	env_override("BOS_REMOTE_BASE_URL", &mut s.remote_base_url);
	env_override("BOS_REMOTE_TIMEOUT_MS", &mut s.remote_timeout_ms);
	env_override("BOS_LOG_LEVEL", &mut s.log_level);
	env_override("BOS_STARTUP_DELAY_MS", &mut s.startup_delay_ms);
	env_override("BOS_BACKGROUND_INTERVAL_MS", &mut s.background_interval_ms);
	env_override("BOS_ITEM_PROCESS_DELAY_MS", &mut s.item_process_delay_ms);
	env_override("BOS_MAX_RETRIES", &mut s.max_retries);
	env_override("BOS_MAX_QUEUE_SIZE", &mut s.max_queue_size);
	env_override("BOS_CACHE_TTL_DEFAULT_HOURS", &mut s.cache_ttl_default_hours);
	env_override("BOS_CACHE_TTL_ORDERS_HOURS", &mut s.cache_ttl_orders_hours);
	env_override("BOS_CACHE_REFRESH_INTERVAL_HOURS", &mut s.cache_refresh_interval_hours);
	env_override("BOS_LAN_LISTEN_PORT", &mut s.lan_listen_port);
	env_override("BOS_LAN_HEARTBEAT_INTERVAL_MS", &mut s.lan_heartbeat_interval_ms);
	env_override("BOS_LAN_STALE_TIMEOUT_MS", &mut s.lan_stale_timeout_ms);
	env_override("BOS_LAN_MAX_RECONNECT_ATTEMPTS", &mut s.lan_max_reconnect_attempts);
	env_override("BOS_LAN_RECONNECT_BACKOFF_BASE_MS", &mut s.lan_reconnect_backoff_base_ms);
	env_override("BOS_LAN_RECONNECT_BACKOFF_MAX_MS", &mut s.lan_reconnect_backoff_max_ms);
	env_override("BOS_STATUS_HOST", &mut s.status_host);
	env_override("BOS_STATUS_PORT", &mut s.status_port);

	if let Ok(raw) = std::env::var("BOS_RETRY_BACKOFF_DELAYS_MS") {
		let parsed: Result<Vec<u64>, _> = raw
			.split(',')
			.map(str::trim)
			.filter(|p| !p.is_empty())
			.map(str::parse::<u64>)
			.collect();
		match parsed {
			Ok(delays) if !delays.is_empty() => s.retry_backoff_delays_ms = delays,
			_ => warn!("ignoring malformed BOS_RETRY_BACKOFF_DELAYS_MS: {}", raw),
		}
	}
	if let Ok(raw) = std::env::var("BOS_LAN_PEERS") {
		s.lan_peers = raw
			.split(',')
			.map(str::trim)
			.filter(|p| !p.is_empty())
			.map(str::to_string)
			.collect();
	}

	s.validate()?;
	Ok(s)
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
	if let Ok(raw) = std::env::var(key) {
		if raw.is_empty() {
			return;
		}
		match raw.parse::<T>() {
			Ok(parsed) => *slot = parsed,
			Err(_) => warn!("ignoring unparsable value for {}: {}", key, raw),
		}
	}
}

/// Receiving side of the hot-reloadable settings channel. Components call
/// `borrow()` at the start of each cycle and never hold the guard across an
/// await point.
pub type SettingsRx = watch::Receiver<Settings>;

/// Owner of the settings channel.
pub struct SettingsWatch {
	tx: watch::Sender<Settings>,
}

impl SettingsWatch {
	pub fn new(initial: Settings) -> Self {
		let (tx, _rx) = watch::channel(initial);
		Self { tx }
	}

	pub fn subscribe(&self) -> SettingsRx {
		self.tx.subscribe()
	}

	pub fn current(&self) -> Settings {
		self.tx.borrow().clone()
	}

	/// Publish new settings. Returns `false` when they were rejected or did
	/// not change anything.
	pub fn publish(&self, next: Settings) -> bool {
		if let Err(e) = next.validate() {
			warn!("rejecting settings reload: {}", e);
			return false;
		}
		self.tx.send_if_modified(|current| {
			if *current == next {
				false
			} else {
				*current = next;
				true
			}
		})
	}

	/// Poll the configuration sources and publish changes until `shutdown`
	/// flips to `true`.
	pub async fn run_reload_loop(&self, mut shutdown: watch::Receiver<bool>) {
		loop {
			let wait = self.tx.borrow().config_reload_interval();
			tokio::select! {
				_ = tokio::time::sleep(wait) => {}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
			match load() {
				Ok(next) => {
					if self.publish(next) {
						info!("configuration reloaded");
					} else {
						debug!("configuration unchanged");
					}
				}
				Err(e) => warn!("failed to reload configuration: {}", e),
			}
		}
	}
}
