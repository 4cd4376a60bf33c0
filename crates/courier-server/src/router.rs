//! Frame dispatch: decode, look up handlers, invoke them in order.
//!
//! Each attached connection gets its own dispatch queue drained by one task,
//! so frames from a single connection run their handlers strictly in the
//! order received while different connections proceed independently.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_core::{BusError, ConnectionId, DiagnosticsSink, Envelope, Incident};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::message::Message;
use crate::peers::{DeliveryReport, PeerSet};
use crate::subscriptions::SubscriptionTable;

/// Outcome of routing one inbound frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

pub(crate) struct RouterInner {
    table: Arc<SubscriptionTable>,
    peers: Arc<PeerSet>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl RouterInner {
    pub(crate) fn broadcast(
        &self,
        envelope: &Envelope,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let frame = match envelope.encode() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(event = envelope.event_name, error = %e, "failed to encode envelope");
                return DeliveryReport::default();
            }
        };
        let report = self.peers.broadcast(&frame, exclude);
        for (conn_id, err) in &report.failed {
            self.diagnostics
                .report(Incident::new(conn_id, Some(&envelope.event_name), err));
        }
        debug!(
            event = envelope.event_name,
            recipients = report.delivered,
            skipped = report.skipped,
            failed = report.failed.len(),
            "broadcast envelope"
        );
        report
    }

    pub(crate) fn send_to(
        &self,
        target: &ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), BusError> {
        let conn = self
            .peers
            .get(target)
            .ok_or_else(|| BusError::connection_closed(target))?;
        conn.send_envelope(envelope)
    }
}

/// Dispatches inbound frames to handlers and publishes outbound envelopes.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        table: Arc<SubscriptionTable>,
        peers: Arc<PeerSet>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                table,
                peers,
                diagnostics,
            }),
        }
    }

    pub fn table(&self) -> &Arc<SubscriptionTable> {
        &self.inner.table
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.inner.peers
    }

    pub fn report(&self, incident: Incident) {
        self.inner.diagnostics.report(incident);
    }

    /// Wire a connection's receive callback to a dedicated dispatch queue.
    ///
    /// The callback only enqueues, so the transport reader never waits on
    /// handlers. The queue holds at most `capacity` frames; a frame arriving
    /// while it is full is dropped and reported as `DispatchQueueFull`. The
    /// dispatch task ends once the connection closes (dropping the callback
    /// and with it the queue sender) and the queue is drained.
    pub fn attach(&self, connection: &Arc<Connection>, capacity: usize) -> JoinHandle<()> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<String>(capacity.max(1));
        let diagnostics = self.inner.diagnostics.clone();
        let owner = connection.id().clone();
        connection.on_receive(move |frame| match queue_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let err = BusError::DispatchQueueFull {
                    connection: owner.to_string(),
                };
                diagnostics.report(Incident::new(&owner, None, &err));
            }
            Err(TrySendError::Closed(_)) => {}
        });

        let router = self.clone();
        let origin = connection.id().clone();
        tokio::spawn(async move {
            while let Some(frame) = queue_rx.recv().await {
                let _ = router.route(&origin, &frame).await;
            }
            debug!(conn_id = %origin, "dispatch queue drained");
        })
    }

    /// Route one raw frame from `origin`.
    ///
    /// Malformed frames are reported and returned as `Err`; the connection is
    /// untouched. Events without subscribers are dropped silently. Handler
    /// errors and panics are caught, reported, and dispatch continues.
    #[instrument(skip_all, fields(conn_id = %origin, event = tracing::field::Empty))]
    pub async fn route(
        &self,
        origin: &ConnectionId,
        frame: &str,
    ) -> Result<DispatchReport, BusError> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.report(Incident::new(origin, None, &err));
                return Err(err);
            }
        };
        let _ = tracing::Span::current().record("event", envelope.event_name.as_str());

        let targets = self.inner.table.dispatch_targets(&envelope.event_name, origin);
        if targets.is_empty() {
            debug!("no subscribers, dropping message");
            return Ok(DispatchReport::default());
        }

        let message = Message::new(Arc::new(envelope), origin.clone(), Arc::downgrade(&self.inner));
        let mut report = DispatchReport::default();
        for subscriber in targets {
            report.invoked += 1;
            let outcome = AssertUnwindSafe(subscriber.handler.handle(message.clone()))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            report.failed += 1;
            let err = BusError::Handler {
                event: message.event_name().to_owned(),
                message: failure,
            };
            self.report(Incident::new(origin, Some(message.event_name()), &err));
        }
        Ok(report)
    }

    /// Broadcast an envelope to every open peer except `exclude`.
    pub fn publish(&self, envelope: &Envelope, exclude: Option<&ConnectionId>) -> DeliveryReport {
        self.inner.broadcast(envelope, exclude)
    }

    /// Send an envelope to one peer.
    pub fn send_to(&self, target: &ConnectionId, envelope: &Envelope) -> Result<(), BusError> {
        self.inner.send_to(target, envelope)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
