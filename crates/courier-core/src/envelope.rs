//! Application-level envelope carried inside each transport frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BusError;

/// Transport control events. These never travel as named messages.
pub const RESERVED_EVENTS: &[&str] = &["connect", "disconnect"];

/// Wire envelope: `{"eventName": "...", "payload": ...}`.
///
/// `payload` may be omitted on the wire and decodes as `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn with_payload<T: Serialize + ?Sized>(
        event_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, BusError> {
        let payload = serde_json::to_value(payload).map_err(|e| BusError::Encode(e.to_string()))?;
        Ok(Self::new(event_name, payload))
    }

    /// Parse a raw text frame. Rejects empty and reserved event names.
    pub fn decode(frame: &str) -> Result<Self, BusError> {
        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| BusError::MalformedFrame(e.to_string()))?;
        if envelope.event_name.is_empty() {
            return Err(BusError::MalformedFrame("empty event name".into()));
        }
        if is_reserved(&envelope.event_name) {
            return Err(BusError::MalformedFrame(format!(
                "reserved event name '{}'",
                envelope.event_name
            )));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::Encode(e.to_string()))
    }
}

pub fn is_reserved(event_name: &str) -> bool {
    RESERVED_EVENTS.contains(&event_name)
}

/// Check an outbound event name before it goes on the wire.
pub fn validate_event_name(event_name: &str) -> Result<(), BusError> {
    if event_name.is_empty() {
        return Err(BusError::Encode("empty event name".into()));
    }
    if is_reserved(event_name) {
        return Err(BusError::ReservedEvent(event_name.to_string()));
    }
    Ok(())
}
