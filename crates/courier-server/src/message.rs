//! A received named message and its `deliver` capability.

use std::sync::{Arc, Weak};

use courier_core::envelope::validate_event_name;
use courier_core::{BusError, ConnectionId, Envelope};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::peers::DeliveryReport;
use crate::router::RouterInner;

/// A named message handed to handlers.
///
/// `deliver` is bound at construction to the router that parsed the frame and
/// always broadcasts to every other open peer. The router is held weakly: a
/// retained message never keeps a torn-down bus alive.
#[derive(Clone)]
pub struct Message {
    envelope: Arc<Envelope>,
    source: ConnectionId,
    router: Weak<RouterInner>,
}

impl Message {
    pub(crate) fn new(
        envelope: Arc<Envelope>,
        source: ConnectionId,
        router: Weak<RouterInner>,
    ) -> Self {
        Self {
            envelope,
            source,
            router,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.envelope.event_name
    }

    pub fn payload(&self) -> &Value {
        &self.envelope.payload
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        T::deserialize(&self.envelope.payload).map_err(|e| BusError::MalformedFrame(e.to_string()))
    }

    /// The connection this message arrived on.
    pub fn source(&self) -> &ConnectionId {
        &self.source
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Re-publish this message to every open peer except its source.
    ///
    /// Each call publishes again. Still works after the source has closed.
    pub fn deliver(&self) -> DeliveryReport {
        match self.router.upgrade() {
            Some(router) => router.broadcast(&self.envelope, Some(&self.source)),
            None => {
                debug!(event = self.event_name(), "router gone, nothing to deliver to");
                DeliveryReport::default()
            }
        }
    }

    /// Send a message back to the source connection only.
    pub fn reply(&self, event_name: &str, payload: Value) -> Result<(), BusError> {
        validate_event_name(event_name)?;
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| BusError::connection_closed(&self.source))?;
        router.send_to(&self.source, &Envelope::new(event_name, payload))
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("event_name", &self.envelope.event_name)
            .field("payload", &self.envelope.payload)
            .field("source", &self.source)
            .finish()
    }
}
