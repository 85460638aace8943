//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)
//! 4. Validate
//!
//! The file is `$COURIER_CONFIG` if set, else `~/.courier/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::session::SessionConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    /// Concurrent WebSocket sessions allowed. 0 means unlimited.
    pub max_connections: usize,
    pub receive_timeout_ms: u64,
    /// Keepalive ping period. 0 disables pings.
    pub ping_interval_secs: u64,
    /// How long after a ping the peer may stay silent.
    pub ping_timeout_secs: u64,
    pub worker_stop_timeout_ms: u64,
    pub echo_client_messages: bool,
    pub echo_prefix: String,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            max_connections: 1024,
            receive_timeout_ms: 1000,
            ping_interval_secs: 10,
            ping_timeout_secs: 20,
            worker_stop_timeout_ms: 5000,
            echo_client_messages: true,
            echo_prefix: "Client message: ".into(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Silence after which a WebSocket peer counts as gone.
    ///
    /// Unbounded when pings are off, since an idle client is then normal.
    pub fn idle_timeout(&self) -> Duration {
        match self.ping_interval() {
            Some(interval) => interval.saturating_add(Duration::from_secs(self.ping_timeout_secs)),
            None => Duration::MAX,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            echo: self.echo_client_messages,
            echo_prefix: self.echo_prefix.clone(),
            worker: WorkerConfig {
                stop_timeout: Duration::from_millis(self.worker_stop_timeout_ms),
                ping_interval: self.ping_interval(),
            },
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        check_range("max_connections", self.max_connections as u64, MAX_CONNECTIONS)?;
        check_range("receive_timeout_ms", self.receive_timeout_ms, RECEIVE_TIMEOUT_MS)?;
        check_range("ping_interval_secs", self.ping_interval_secs, PING_INTERVAL_SECS)?;
        if self.ping_interval_secs > 0 {
            check_range("ping_timeout_secs", self.ping_timeout_secs, PING_TIMEOUT_SECS)?;
        } else {
            check_range("ping_timeout_secs", self.ping_timeout_secs, (0, PING_TIMEOUT_SECS.1))?;
        }
        check_range(
            "worker_stop_timeout_ms",
            self.worker_stop_timeout_ms,
            WORKER_STOP_TIMEOUT_MS,
        )?;
        check_range(
            "shutdown_timeout_secs",
            self.shutdown_timeout_secs,
            SHUTDOWN_TIMEOUT_SECS,
        )?;
        Ok(())
    }
}

// Inclusive bounds shared by file validation and env overrides.
const MAX_CONNECTIONS: (u64, u64) = (0, 1_000_000);
const RECEIVE_TIMEOUT_MS: (u64, u64) = (10, 60_000);
const PING_INTERVAL_SECS: (u64, u64) = (0, 3600);
const PING_TIMEOUT_SECS: (u64, u64) = (1, 3600);
const WORKER_STOP_TIMEOUT_MS: (u64, u64) = (1, 60_000);
const SHUTDOWN_TIMEOUT_SECS: (u64, u64) = (1, 600);

fn check_range(name: &str, value: u64, (min, max): (u64, u64)) -> Result<()> {
    if value < min || value > max {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

/// Resolve the config file path.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var("COURIER_CONFIG").ok().filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("config.json")
}

pub fn load_config() -> Result<ServerConfig> {
    load_config_from_path(&config_path())
}

/// Load from `path` with process environment overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig> {
    load_config_with(path, |name| std::env::var(name).ok())
}

/// Load from `path`, reading overrides through `lookup`.
pub fn load_config_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServerConfig> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_overrides(&mut config, lookup);
    config.validate()?;
    Ok(config)
}

/// Recursive merge: objects merge per key, everything else is replaced,
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` overrides. Invalid values are ignored with a warning.
pub fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("COURIER_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u64_in("COURIER_PORT", (0, u64::from(u16::MAX))) {
        config.port = v as u16;
    }
    if let Some(v) = env.u64_in("COURIER_MAX_CONNECTIONS", MAX_CONNECTIONS) {
        config.max_connections = v as usize;
    }
    if let Some(v) = env.u64_in("COURIER_RECEIVE_TIMEOUT_MS", RECEIVE_TIMEOUT_MS) {
        config.receive_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("COURIER_PING_INTERVAL_SECS", PING_INTERVAL_SECS) {
        config.ping_interval_secs = v;
    }
    if let Some(v) = env.u64_in("COURIER_PING_TIMEOUT_SECS", PING_TIMEOUT_SECS) {
        config.ping_timeout_secs = v;
    }
    if let Some(v) = env.u64_in("COURIER_WORKER_STOP_TIMEOUT_MS", WORKER_STOP_TIMEOUT_MS) {
        config.worker_stop_timeout_ms = v;
    }
    if let Some(v) = env.bool("COURIER_ECHO") {
        config.echo_client_messages = v;
    }
    if let Some(v) = env.raw("COURIER_ECHO_PREFIX") {
        config.echo_prefix = v;
    }
    if let Some(v) = env.u64_in("COURIER_SHUTDOWN_TIMEOUT_SECS", SHUTDOWN_TIMEOUT_SECS) {
        config.shutdown_timeout_secs = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    /// Value as given, empty strings included.
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.raw(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, (min, max): (u64, u64)) -> Option<u64> {
        let val = self.raw(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "out-of-range env var, ignoring");
        }
        result
    }
}
