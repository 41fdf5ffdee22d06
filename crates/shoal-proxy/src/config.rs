//! Proxy configuration types.
//!
//! The core consumes only already-validated values; the binary is
//! responsible for reading the JSON file and flag overrides and calling
//! [`ProxyConfig::validate`] before handing the config over. All
//! timeouts are configured in milliseconds and surfaced to the core as
//! a [`Timeouts`] bundle of `Duration`s.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Default pool capacity per shard.
const DEFAULT_POOL_CAPACITY: usize = 10;

/// Default maximum number of concurrent client sessions.
const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Validated proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address the proxy listens on for client connections.
    pub listen_addr: SocketAddr,

    /// Backend shard endpoints, `host:port`. One pool is built per entry;
    /// entry order determines hash ring slot assignment, so reordering
    /// this list remaps keys.
    pub shards: Vec<String>,

    /// Bounded connection count per shard pool.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Maximum concurrent client sessions; excess connections are dropped
    /// at accept time.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Address for the prometheus metrics endpoint. Absent = no exporter.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    /// Interval between background shard liveness checks, in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Grace period for draining in-flight sessions at shutdown, in
    /// milliseconds.
    #[serde(default = "default_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Backend dial timeout.
    #[serde(default = "default_connect_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single read from a backend.
    #[serde(default = "default_rw_ms")]
    pub backend_read_timeout_ms: u64,

    /// Timeout for a single write to a backend.
    #[serde(default = "default_rw_ms")]
    pub backend_write_timeout_ms: u64,

    /// Timeout for a single read from a client. Expiry is not fatal; it
    /// only bounds how long the reader blocks before re-checking the
    /// shutdown flag.
    #[serde(default = "default_client_ms")]
    pub client_read_timeout_ms: u64,

    /// Timeout for a single write to a client.
    #[serde(default = "default_client_ms")]
    pub client_write_timeout_ms: u64,

    /// Timeout for one liveness probe round-trip.
    #[serde(default = "default_probe_ms")]
    pub probe_timeout_ms: u64,
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}
fn default_check_interval_ms() -> u64 {
    1_000
}
fn default_grace_ms() -> u64 {
    5_000
}
fn default_connect_ms() -> u64 {
    1_000
}
fn default_rw_ms() -> u64 {
    2_000
}
fn default_client_ms() -> u64 {
    250
}
fn default_probe_ms() -> u64 {
    1_000
}

/// The six independent timeout durations the core carries around.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub backend_read: Duration,
    pub backend_write: Duration,
    pub client_read: Duration,
    pub client_write: Duration,
    pub probe: Duration,
}

impl ProxyConfig {
    /// Parses a configuration from its JSON representation.
    ///
    /// Binary-side collaborator entry point; the core never parses.
    pub fn from_json(input: &str) -> Result<Self, String> {
        let config: ProxyConfig =
            serde_json::from_str(input).map_err(|e| format!("invalid config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the core relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.shards.is_empty() {
            return Err("at least one shard endpoint is required".into());
        }
        // the hash ring's prime table tops out at 101
        if self.shards.len() > 101 {
            return Err(format!(
                "too many shards: {} (maximum 101)",
                self.shards.len()
            ));
        }
        if self.pool_capacity == 0 {
            return Err("pool_capacity must be at least 1".into());
        }
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1".into());
        }
        Ok(())
    }

    /// The timeout bundle consumed by the core.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            backend_read: Duration::from_millis(self.backend_read_timeout_ms),
            backend_write: Duration::from_millis(self.backend_write_timeout_ms),
            client_read: Duration::from_millis(self.client_read_timeout_ms),
            client_write: Duration::from_millis(self.client_write_timeout_ms),
            probe: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
