//! Bus and client configuration.
//!
//! Loading flow for [`BusConfig`]:
//! 1. Start with compiled defaults
//! 2. If a config file is given, deep-merge its JSON over the defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use courier_core::BusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Configuration for a [`Bus`](crate::Bus).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Route serving the WebSocket upgrade (default `"/ws"`).
    pub path: String,
    /// Maximum concurrent connections; further upgrades get 503.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
    /// Inbound frames queued per connection awaiting dispatch; extra frames
    /// are dropped and reported.
    pub max_pending_frames: usize,
    /// Seconds between server pings.
    pub ping_interval_secs: u64,
    /// Close a peer after this many seconds without any inbound traffic.
    pub pong_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Seconds `shutdown` waits for session tasks before giving up.
    pub shutdown_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            path: "/ws".into(),
            max_connections: 1024,
            send_queue_capacity: 256,
            max_pending_frames: 1024,
            ping_interval_secs: 25,
            pong_timeout_secs: 60,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            shutdown_timeout_secs: 10,
        }
    }
}

impl BusConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject values the listener cannot serve.
    pub fn validate(&self) -> Result<(), BusError> {
        if !self.path.starts_with('/') {
            return Err(BusError::Config(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.path == "/health" {
            return Err(BusError::Config("path '/health' is reserved".into()));
        }
        if self.send_queue_capacity == 0 {
            return Err(BusError::Config(
                "send_queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_pending_frames == 0 {
            return Err(BusError::Config("max_pending_frames must be at least 1".into()));
        }
        if self.ping_interval_secs == 0 {
            return Err(BusError::Config(
                "ping_interval_secs must be at least 1".into(),
            ));
        }
        if self.pong_timeout_secs < self.ping_interval_secs {
            return Err(BusError::Config(
                "pong_timeout_secs must not be shorter than ping_interval_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`ClientHandle`](crate::ClientHandle).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound frames buffered before `emit` fails with `SendQueueFull`.
    pub send_queue_capacity: usize,
    /// Inbound frames queued awaiting dispatch before extras are dropped.
    pub max_pending_frames: usize,
    /// Seconds to wait for the WebSocket handshake.
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            max_pending_frames: 1024,
            connect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Load a [`BusConfig`] from an optional JSON file plus process env overrides.
///
/// A missing file falls back to defaults; unreadable or invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<BusConfig, BusError> {
    let defaults =
        serde_json::to_value(BusConfig::default()).map_err(|e| BusError::Config(e.to_string()))?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading bus config from file");
            let content = std::fs::read_to_string(path)
                .map_err(|e| BusError::Config(format!("{}: {e}", path.display())))?;
            let user: Value = serde_json::from_str(&content)
                .map_err(|e| BusError::Config(format!("{}: {e}", path.display())))?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let config: BusConfig =
        serde_json::from_value(merged).map_err(|e| BusError::Config(e.to_string()))?;
    let config = apply_overrides(config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
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

/// Apply `COURIER_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored.
pub fn apply_overrides<F>(mut config: BusConfig, lookup: F) -> BusConfig
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str| lookup(key).filter(|v| !v.is_empty());
    let number = |key: &str, min: u64, max: u64| -> Option<u64> {
        let raw = string(key)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            warn!(key, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("COURIER_HOST") {
        config.host = v;
    }
    if let Some(v) = string("COURIER_PATH") {
        config.path = v;
    }
    if let Some(v) = number("COURIER_MAX_CONNECTIONS", 1, 1_000_000) {
        config.max_connections = v as usize;
    }
    if let Some(v) = number("COURIER_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        config.send_queue_capacity = v as usize;
    }
    if let Some(v) = number("COURIER_MAX_PENDING_FRAMES", 1, 1_000_000) {
        config.max_pending_frames = v as usize;
    }
    if let Some(v) = number("COURIER_PING_INTERVAL_SECS", 1, 3_600) {
        config.ping_interval_secs = v;
    }
    if let Some(v) = number("COURIER_PONG_TIMEOUT_SECS", 1, 86_400) {
        config.pong_timeout_secs = v;
    }
    config
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
