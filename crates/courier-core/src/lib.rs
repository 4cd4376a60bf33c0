pub mod diagnostics;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use diagnostics::{DiagnosticsSink, Incident, NullSink};
pub use envelope::{Envelope, RESERVED_EVENTS};
pub use errors::BusError;
pub use ids::{ConnectionId, SubscriptionId};
