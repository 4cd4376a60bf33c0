//! Incidents that are reported locally and never surfaced to the remote peer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::BusError;
use crate::ids::ConnectionId;

/// A single reported failure: a dropped frame, a failed handler, or a send
/// that could not be enqueued for one peer.
#[derive(Clone, Debug, Serialize)]
pub struct Incident {
    pub at: DateTime<Utc>,
    pub connection: ConnectionId,
    pub event_name: Option<String>,
    pub kind: &'static str,
    pub message: String,
}

impl Incident {
    pub fn new(connection: &ConnectionId, event_name: Option<&str>, error: &BusError) -> Self {
        Self {
            at: Utc::now(),
            connection: connection.clone(),
            event_name: event_name.map(str::to_owned),
            kind: error.error_kind(),
            message: error.to_string(),
        }
    }
}

/// Destination for incidents.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, incident: Incident);
}

/// Discards every incident.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn report(&self, _incident: Incident) {}
}
