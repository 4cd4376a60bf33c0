mod incidents;

pub use incidents::{FanoutSink, IncidentLog, IncidentQuery, TracingSink};

use std::sync::Arc;

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    #[serde(with = "level_serde")]
    pub log_level: Level,
    /// Per-module level overrides (e.g. "courier_server" => DEBUG).
    #[serde(skip)]
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// How many incidents the in-memory log keeps. Zero disables it.
    pub incident_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            incident_capacity: 1024,
        }
    }
}

impl TelemetryConfig {
    /// The filter directive string built from the level and module overrides.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Holds the incident log created at startup.
pub struct TelemetryGuard {
    incidents: Option<Arc<IncidentLog>>,
}

impl TelemetryGuard {
    /// Access the in-memory incident log for querying.
    pub fn incidents(&self) -> Option<&Arc<IncidentLog>> {
        self.incidents.as_ref()
    }

    /// The sink to hand to a bus or client: every incident is logged through
    /// `tracing` and, when enabled, kept in the incident log.
    pub fn diagnostics(&self) -> Arc<dyn courier_core::DiagnosticsSink> {
        match &self.incidents {
            Some(log) => {
                let sinks: Vec<Arc<dyn courier_core::DiagnosticsSink>> =
                    vec![Arc::new(TracingSink), log.clone()];
                Arc::new(FanoutSink::new(sinks))
            }
            None => Arc::new(TracingSink),
        }
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls keep
/// the first subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    let incidents = (config.incident_capacity > 0)
        .then(|| Arc::new(IncidentLog::new(config.incident_capacity)));

    TelemetryGuard { incidents }
}

mod level_serde {
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer};
    use tracing::Level;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Level::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.log_level, Level::INFO);
        assert!(!cfg.json);
        assert_eq!(cfg.incident_capacity, 1024);
    }

    #[test]
    fn filter_includes_module_levels() {
        let cfg = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("courier_server".into(), Level::DEBUG)],
            ..TelemetryConfig::default()
        };
        assert_eq!(cfg.filter_directives(), "warn,courier_server=debug");
    }

    #[test]
    fn level_parses_from_json() {
        let cfg: TelemetryConfig =
            serde_json::from_str(r#"{"log_level":"debug","json":true}"#).unwrap();
        assert_eq!(cfg.log_level, Level::DEBUG);
        assert!(cfg.json);
        assert_eq!(cfg.incident_capacity, 1024);
    }

    #[test]
    fn init_twice_does_not_panic() {
        let first = init_telemetry(&TelemetryConfig::default());
        let second = init_telemetry(&TelemetryConfig {
            incident_capacity: 0,
            ..TelemetryConfig::default()
        });
        assert!(first.incidents().is_some());
        assert!(second.incidents().is_none());
    }
}
