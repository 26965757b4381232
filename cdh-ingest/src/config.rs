use std::path::{Path, PathBuf};
use std::time::Duration;

use cdh_core::protocol::{DEFAULT_SUBPROTOCOL, MAX_EVENT_COUNT_LIMIT};
use cdh_tls::TlsConfig;
use serde::Deserialize;

pub const USERNAME_ENV: &str = "CDH_USERNAME";
pub const PASSWORD_ENV: &str = "CDH_PASSWORD";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub feed: FeedConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Connection and protocol settings. Fixed for the lifetime of a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Websocket endpoint of the vendor feed
    pub url: String,
    /// Subprotocol requested in the handshake
    pub subprotocol: String,
    pub username: String,
    pub password: String,
    /// Vendor event partition (1-4)
    pub event_partition: u8,
    /// `MaxEventCount` sent with every GetEvents request
    pub max_event_count: u32,
    /// Interval in seconds between scheduled polls
    pub poll_interval_secs: u64,
    /// Delay before the first poll after a successful connect
    pub initial_poll_delay_ms: u64,
    /// Interval in seconds between websocket pings
    pub heartbeat_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    /// How long to wait for a response before releasing the request slot
    pub request_timeout_secs: u64,
    /// Consecutive failed connections tolerated before giving up
    pub max_reconnect_attempts: u32,
    pub reconnect_base_secs: u64,
    pub reconnect_cap_secs: u64,
    /// Persist the cursor every N accepted events
    pub flush_every: u64,
    /// Dedup window size that triggers a trim
    pub dedup_capacity: usize,
    /// Number of most recent ids kept after a trim
    pub dedup_retain: usize,
    /// Maximum number of devices tracked in the snapshot cache
    pub device_capacity: usize,
    /// Events buffered between the connection and the sink
    pub sink_buffer: usize,
    pub stall: StallPolicy,
}

/// What to do when polls keep being skipped because the vendor never
/// finishes a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StallPolicy {
    /// Consecutive skipped polls before `action` runs. `None` waits forever.
    pub max_skipped_polls: Option<u32>,
    pub action: StallAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallAction {
    /// Drop the connection and go through the reconnect path.
    #[default]
    Reconnect,
    /// Clear the local wait state and poll on the same tick.
    Reset,
    /// Keep skipping and only log.
    Wait,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    File { path: PathBuf },
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interval in seconds between status log lines
    pub status_log_interval_secs: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("feed url must use ws:// or wss://, got {0}")]
    InvalidUrl(String),
    #[error("event_partition must be between 1 and 4, got {0}")]
    InvalidPartition(u8),
    #[error("max_event_count must be between 1 and {MAX_EVENT_COUNT_LIMIT}, got {0}")]
    InvalidBatchSize(u32),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("dedup_retain ({retain}) must be smaller than dedup_capacity ({capacity})")]
    DedupBounds { retain: usize, capacity: usize },
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.feed.apply_env();
        config.feed.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut feed = FeedConfig::default();
        feed.apply_env();

        Self {
            feed,
            storage: StorageConfig::File {
                path: PathBuf::from("./state/last-event-state.json"),
            },
            tls: TlsConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Credentials from the environment take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(username) = std::env::var(USERNAME_ENV) {
            self.username = username;
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.password = password;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if !(1..=4).contains(&self.event_partition) {
            return Err(ConfigError::InvalidPartition(self.event_partition));
        }
        if !(1..=MAX_EVENT_COUNT_LIMIT).contains(&self.max_event_count) {
            return Err(ConfigError::InvalidBatchSize(self.max_event_count));
        }

        let non_zero = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("reconnect_base_secs", self.reconnect_base_secs),
            ("flush_every", self.flush_every),
            ("dedup_capacity", self.dedup_capacity as u64),
            ("device_capacity", self.device_capacity as u64),
            ("sink_buffer", self.sink_buffer as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }

        if self.dedup_retain >= self.dedup_capacity {
            return Err(ConfigError::DedupBounds {
                retain: self.dedup_retain,
                capacity: self.dedup_capacity,
            });
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_poll_delay(&self) -> Duration {
        Duration::from_millis(self.initial_poll_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(self.reconnect_base_secs);
        let cap = Duration::from_secs(self.reconnect_cap_secs).max(base);
        let exponent = attempt.saturating_sub(1).min(31);

        base.checked_mul(1u32 << exponent)
            .map_or(cap, |delay| delay.min(cap))
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://wamc.wamcentral.net:44355/cdh".to_string(),
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
            username: String::new(),
            password: String::new(),
            event_partition: 1,
            max_event_count: 100,
            poll_interval_secs: 300,
            initial_poll_delay_ms: 1_000,
            heartbeat_interval_secs: 30,
            handshake_timeout_secs: 30,
            request_timeout_secs: 30,
            max_reconnect_attempts: 10,
            reconnect_base_secs: 5,
            reconnect_cap_secs: 60,
            flush_every: 25,
            dedup_capacity: 1_000,
            dedup_retain: 500,
            device_capacity: 10_000,
            sink_buffer: 256,
            stall: StallPolicy::default(),
        }
    }
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            max_skipped_polls: Some(3),
            action: StallAction::Reconnect,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_log_interval_secs: 60,
        }
    }
}
