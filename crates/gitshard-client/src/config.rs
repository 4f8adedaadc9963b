//! Client configuration and the fleet configuration source.
//!
//! [`ClientConfig`] holds tuning knobs read once at construction.
//! [`FleetConfig`] (shard addresses and pins) changes at runtime and is
//! delivered through a [`ConfigSource`].

use crate::context::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Upper bound on concurrent shard calls of one fan-out.
pub const MAX_CONCURRENT_SHARD_CALLS: usize = 32;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitshardConfig {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl GitshardConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

/// Shard addresses and repository pins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Ordered shard addresses. Order determines hash placement.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Repository name to shard address overrides.
    #[serde(default)]
    pub pinned: HashMap<String, String>,
}

impl FleetConfig {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            pinned: HashMap::new(),
        }
    }

    pub fn with_pin(mut self, repo: impl Into<String>, addr: impl Into<String>) -> Self {
        self.pinned.insert(repo.into(), addr.into());
        self
    }
}

/// Default connection timeout in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default number of attempts per retryable call.
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default delay before the first retry in milliseconds.
const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Default ceiling of the retry backoff in milliseconds.
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 2000;

/// Default in-flight request limit per binary connection.
const DEFAULT_MAX_PENDING_REQUESTS: usize = 1000;

/// Default size of the legacy HTTP permit pool.
const DEFAULT_HTTP_PERMITS: usize = 500;

/// Client tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for dialing a shard, on either protocol.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Attempts per retryable call, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Backoff before the first retry; doubled on every later one.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Ceiling of the retry backoff.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// In-flight request limit per binary connection.
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,
    /// Concurrent legacy HTTP requests across all shards.
    #[serde(default = "default_http_permits")]
    pub http_permits: usize,
    /// Concurrent shard calls of one fan-out; clamped to
    /// [`MAX_CONCURRENT_SHARD_CALLS`].
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
    /// `User-Agent` sent with every legacy HTTP request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Protocol of contexts built by [`crate::GitserverClient::context`].
    #[serde(default)]
    pub default_protocol: Protocol,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_max_retry_delay_ms() -> u64 {
    DEFAULT_MAX_RETRY_DELAY_MS
}

fn default_max_pending_requests() -> usize {
    DEFAULT_MAX_PENDING_REQUESTS
}

fn default_http_permits() -> usize {
    DEFAULT_HTTP_PERMITS
}

fn default_fanout_limit() -> usize {
    MAX_CONCURRENT_SHARD_CALLS
}

fn default_user_agent() -> String {
    format!("gitshard-client/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            http_permits: DEFAULT_HTTP_PERMITS,
            fanout_limit: MAX_CONCURRENT_SHARD_CALLS,
            user_agent: default_user_agent(),
            default_protocol: Protocol::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Fan-out limit, clamped to [`MAX_CONCURRENT_SHARD_CALLS`].
    pub fn fanout_limit(&self) -> usize {
        self.fanout_limit.clamp(1, MAX_CONCURRENT_SHARD_CALLS)
    }
}

/// Source of live fleet configuration.
pub trait ConfigSource: Send + Sync + 'static {
    /// Receiver observing the current value and every later change.
    fn subscribe(&self) -> watch::Receiver<FleetConfig>;
}

/// Config source backed by a `watch` channel. Updates are pushed with
/// [`WatchConfigSource::update`].
#[derive(Debug)]
pub struct WatchConfigSource {
    tx: watch::Sender<FleetConfig>,
}

impl WatchConfigSource {
    pub fn new(initial: FleetConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new configuration to every subscriber.
    pub fn update(&self, config: FleetConfig) {
        self.tx.send_replace(config);
    }

    pub fn current(&self) -> FleetConfig {
        self.tx.borrow().clone()
    }
}

impl ConfigSource for WatchConfigSource {
    fn subscribe(&self) -> watch::Receiver<FleetConfig> {
        self.tx.subscribe()
    }
}
