//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the bus is listening.
    pub status: String,
    /// Seconds since the bus started listening.
    pub uptime_secs: u64,
    /// Open connections.
    pub connections: usize,
    /// Distinct event names with at least one registration.
    pub events: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, events: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        events,
    }
}
