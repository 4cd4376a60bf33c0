//! The set of open connections that take part in broadcast.

use std::sync::Arc;

use courier_core::{BusError, ConnectionId};
use dashmap::DashMap;
use tracing::debug;

use crate::connection::Connection;

/// Outcome of sending one frame to many peers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Peers the frame was enqueued for.
    pub delivered: usize,
    /// Peers that were closing or closed and were skipped silently.
    pub skipped: usize,
    /// Peers whose queue rejected the frame.
    pub failed: Vec<(ConnectionId, BusError)>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Open connections indexed by id.
#[derive(Default)]
pub struct PeerSet {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        let _ = self.connections.insert(connection.id().clone(), connection);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Clone out the current members so sends happen without holding shard
    /// locks.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Enqueue `frame` on every member except `exclude`.
    ///
    /// A failure on one peer never stops delivery to the others.
    pub fn broadcast(&self, frame: &Arc<String>, exclude: Option<&ConnectionId>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for conn in self.snapshot() {
            if exclude == Some(conn.id()) {
                continue;
            }
            match conn.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(BusError::ConnectionClosed { .. }) => {
                    debug!(conn_id = %conn.id(), "skipping closed peer");
                    report.skipped += 1;
                }
                Err(e) => report.failed.push((conn.id().clone(), e)),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CloseReason, Outbound};
    use tokio::sync::mpsc;

    fn peer(id: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Connection::open(ConnectionId::from_raw(id), tx).unwrap(), rx)
    }

    fn frame(text: &str) -> Arc<String> {
        Arc::new(text.to_string())
    }

    #[test]
    fn add_and_remove() {
        let peers = PeerSet::new();
        let (c1, _rx1) = peer("c1", 8);
        peers.add(c1);
        assert_eq!(peers.count(), 1);
        assert!(peers.get(&ConnectionId::from_raw("c1")).is_some());
        assert!(peers.remove(&ConnectionId::from_raw("c1")).is_some());
        assert_eq!(peers.count(), 0);
        assert!(peers.remove(&ConnectionId::from_raw("c1")).is_none());
    }

    #[test]
    fn broadcast_excludes_origin() {
        let peers = PeerSet::new();
        let (a, mut rx_a) = peer("a", 8);
        let (b, mut rx_b) = peer("b", 8);
        let (c, mut rx_c) = peer("c", 8);
        peers.add(a);
        peers.add(b);
        peers.add(c);

        let report = peers.broadcast(&frame("hi"), Some(&ConnectionId::from_raw("a")));
        assert_eq!(report.delivered, 2);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[test]
    fn broadcast_without_exclusion_reaches_all() {
        let peers = PeerSet::new();
        let (a, mut rx_a) = peer("a", 8);
        let (b, mut rx_b) = peer("b", 8);
        peers.add(a);
        peers.add(b);
        let report = peers.broadcast(&frame("hi"), None);
        assert_eq!(report.delivered, 2);
        assert!(report.is_clean());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn full_peer_does_not_block_others() {
        let peers = PeerSet::new();
        let (slow, _rx_slow) = peer("slow", 1);
        let (fast, mut rx_fast) = peer("fast", 8);
        slow.send(frame("filler")).unwrap();
        peers.add(slow);
        peers.add(fast);

        let report = peers.broadcast(&frame("hi"), None);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.as_str(), "slow");
        assert!(rx_fast.try_recv().is_ok());
    }

    #[test]
    fn closed_peer_is_skipped_silently() {
        let peers = PeerSet::new();
        let (gone, _rx_gone) = peer("gone", 8);
        let (live, mut rx_live) = peer("live", 8);
        let _ = gone.close(CloseReason::TransportLost);
        peers.add(gone);
        peers.add(live);

        let report = peers.broadcast(&frame("hi"), None);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.is_clean());
        assert!(rx_live.try_recv().is_ok());
    }

    #[test]
    fn broadcast_to_empty_set() {
        let peers = PeerSet::new();
        let report = peers.broadcast(&frame("hi"), None);
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn ids_lists_members() {
        let peers = PeerSet::new();
        let (a, _rx_a) = peer("a", 8);
        let (b, _rx_b) = peer("b", 8);
        peers.add(a);
        peers.add(b);
        let mut ids: Vec<String> = peers.ids().into_iter().map(|id| id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
