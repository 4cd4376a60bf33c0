/// Error taxonomy for bus, connection and client operations.
///
/// Variants fall into three groups: setup errors that fail a `listen` or
/// `connect` call outright, per-message incidents that are reported and
/// dropped, and transport errors that tear a connection down.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    // Setup: surfaced directly to the caller
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("bus is already listening on {addr}")]
    AlreadyListening { addr: String },
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),

    // Per-connection
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection {connection} is closed")]
    ConnectionClosed { connection: String },
    #[error("send queue full for connection {connection}")]
    SendQueueFull { connection: String },
    #[error("dispatch queue full for connection {connection}, frame dropped")]
    DispatchQueueFull { connection: String },

    // Per-message
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("event name '{0}' is reserved for transport control")]
    ReservedEvent(String),
    #[error("handler for '{event}' failed: {message}")]
    Handler { event: String, message: String },
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl BusError {
    /// Errors that fail a `listen` or `connect` call and never occur afterwards.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. }
                | Self::AlreadyListening { .. }
                | Self::ConnectionFailed { .. }
                | Self::Config(_)
        )
    }

    /// Only transport-level loss terminates a connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short classification string for logging and incident queries.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::AlreadyListening { .. } => "already_listening",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::SendQueueFull { .. } => "send_queue_full",
            Self::DispatchQueueFull { .. } => "dispatch_queue_full",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::ReservedEvent(_) => "reserved_event",
            Self::Handler { .. } => "handler",
            Self::Encode(_) => "encode",
        }
    }

    pub fn connection_closed(connection: impl std::fmt::Display) -> Self {
        Self::ConnectionClosed {
            connection: connection.to_string(),
        }
    }
}
