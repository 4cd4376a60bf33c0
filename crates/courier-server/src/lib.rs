//! # courier-server
//!
//! Named-event message bus over persistent WebSocket connections.
//!
//! - `Bus`: axum listener, session admission, heartbeat, graceful shutdown
//! - `ClientHandle`: the initiating end of the same protocol
//! - `Router`: per-connection dispatch queue and the `deliver` broadcast
//! - `/health` endpoint for liveness checks

#![deny(unsafe_code)]

// Handler failures are isolated with `catch_unwind`, which is a no-op when
// panics abort.
#[cfg(panic = "abort")]
compile_error!("courier-server requires panic = \"unwind\"; handler panics must be catchable");

pub mod bus;
pub mod client;
pub mod config;
pub mod connection;
pub mod handler;
pub mod health;
pub mod message;
pub mod peers;
pub mod router;
mod session;
pub mod shutdown;
pub mod subscriptions;

pub use bus::{Bus, ConnectionScope};
pub use client::ClientHandle;
pub use config::{load_config, BusConfig, ClientConfig};
pub use connection::{CloseReason, Connection, ConnectionState};
pub use handler::{handler_fn, EventHandler, HandlerResult};
pub use message::Message;
pub use peers::DeliveryReport;
pub use router::{DispatchReport, Router};
pub use subscriptions::{SubscriptionHandle, SubscriptionTable};
