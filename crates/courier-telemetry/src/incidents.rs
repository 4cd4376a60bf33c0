use std::collections::VecDeque;
use std::sync::Arc;

use courier_core::{ConnectionId, DiagnosticsSink, Incident};
use parking_lot::Mutex;

/// Logs every incident at WARN through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn report(&self, incident: Incident) {
        tracing::warn!(
            conn_id = %incident.connection,
            event = incident.event_name.as_deref().unwrap_or(""),
            kind = incident.kind,
            "{}",
            incident.message
        );
    }
}

/// Query parameters for searching recorded incidents.
#[derive(Clone, Debug, Default)]
pub struct IncidentQuery {
    pub kind: Option<String>,
    pub connection: Option<ConnectionId>,
    pub limit: Option<usize>,
}

/// Bounded in-memory incident log. The oldest entry is evicted once full.
pub struct IncidentLog {
    entries: Mutex<VecDeque<Incident>>,
    capacity: usize,
}

impl IncidentLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Matching incidents, newest first.
    pub fn query(&self, q: &IncidentQuery) -> Vec<Incident> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .filter(|i| q.kind.as_deref().map_or(true, |k| i.kind == k))
            .filter(|i| q.connection.as_ref().map_or(true, |c| &i.connection == c))
            .take(q.limit.unwrap_or(100))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DiagnosticsSink for IncidentLog {
    fn report(&self, incident: Incident) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            let _ = entries.pop_front();
        }
        entries.push_back(incident);
    }
}

/// Forwards each incident to every inner sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DiagnosticsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn DiagnosticsSink>>) -> Self {
        Self { sinks }
    }
}

impl DiagnosticsSink for FanoutSink {
    fn report(&self, incident: Incident) {
        for sink in &self.sinks {
            sink.report(incident.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::BusError;

    fn incident(conn: &str, err: BusError) -> Incident {
        Incident::new(&ConnectionId::from_raw(conn), Some("say"), &err)
    }

    #[test]
    fn records_and_counts() {
        let log = IncidentLog::new(10);
        log.report(incident("c1", BusError::MalformedFrame("eof".into())));
        log.report(incident("c2", BusError::MalformedFrame("eof".into())));
        assert_eq!(log.count(), 2);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let log = IncidentLog::new(2);
        log.report(incident("c1", BusError::MalformedFrame("a".into())));
        log.report(incident("c2", BusError::MalformedFrame("b".into())));
        log.report(incident("c3", BusError::MalformedFrame("c".into())));
        assert_eq!(log.count(), 2);
        let all = log.query(&IncidentQuery::default());
        assert_eq!(all[0].connection.as_str(), "c3");
        assert_eq!(all[1].connection.as_str(), "c2");
    }

    #[test]
    fn query_filters_by_kind_and_connection() {
        let log = IncidentLog::new(10);
        log.report(incident("c1", BusError::MalformedFrame("a".into())));
        log.report(incident(
            "c1",
            BusError::Handler {
                event: "say".into(),
                message: "boom".into(),
            },
        ));
        log.report(incident("c2", BusError::MalformedFrame("b".into())));

        let malformed = log.query(&IncidentQuery {
            kind: Some("malformed_frame".into()),
            ..IncidentQuery::default()
        });
        assert_eq!(malformed.len(), 2);

        let c1 = log.query(&IncidentQuery {
            connection: Some(ConnectionId::from_raw("c1")),
            ..IncidentQuery::default()
        });
        assert_eq!(c1.len(), 2);

        let limited = log.query(&IncidentQuery {
            limit: Some(1),
            ..IncidentQuery::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn clear_empties_log() {
        let log = IncidentLog::new(4);
        log.report(incident("c1", BusError::MalformedFrame("a".into())));
        log.clear();
        assert_eq!(log.count(), 0);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(IncidentLog::new(4));
        let b = Arc::new(IncidentLog::new(4));
        let sinks: Vec<Arc<dyn DiagnosticsSink>> =
            vec![a.clone(), b.clone(), Arc::new(TracingSink)];
        let fanout = FanoutSink::new(sinks);
        fanout.report(incident("c1", BusError::MalformedFrame("a".into())));
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }
}
