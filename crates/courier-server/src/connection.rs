//! One transport session: framed send/receive and the open/closed lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::{BusError, ConnectionId, Envelope};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Item on a connection's outbound queue, drained by the transport writer.
#[derive(Debug)]
pub enum Outbound {
    Frame(Arc<String>),
    /// Flush marker: everything queued before it is written, then the
    /// transport is closed.
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally through the API.
    Normal,
    /// The peer sent a close frame.
    Remote,
    /// Read or write on the transport failed.
    TransportLost,
    HeartbeatTimeout,
    Shutdown,
    /// The session was unusable before it opened.
    HandshakeFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Remote => "remote",
            Self::TransportLost => "transport_lost",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
            Self::HandshakeFailed => "handshake_failed",
        }
    }
}

type ReceiveCallback = Arc<dyn Fn(String) + Send + Sync>;
type CloseCallback = Box<dyn FnOnce(&ConnectionId, CloseReason) + Send>;

/// A persistent bidirectional session with one peer.
pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    /// Send channel to the session's transport write task.
    tx: mpsc::Sender<Outbound>,
    on_receive: Mutex<Option<ReceiveCallback>>,
    on_close: Mutex<Vec<CloseCallback>>,
    close_reason: Mutex<Option<CloseReason>>,
    closed: CancellationToken,
    connected_at: Instant,
    /// Whether the peer has shown activity since the last heartbeat check.
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Wrap a session in the `connecting` state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            tx,
            on_receive: Mutex::new(None),
            on_close: Mutex::new(Vec::new()),
            close_reason: Mutex::new(None),
            closed: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        })
    }

    /// Wrap an established session and open it immediately.
    pub fn open(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Result<Arc<Self>, BusError> {
        let connection = Self::new(id, tx);
        connection.establish()?;
        Ok(connection)
    }

    /// Move `connecting → open`.
    ///
    /// If the transport writer is already gone the connection moves straight
    /// to `closed` (with close notification) and `Transport` is returned.
    pub fn establish(&self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(BusError::connection_closed(&self.id));
            }
            ConnectionState::Connecting => {}
        }
        if self.tx.is_closed() {
            drop(state);
            let _ = self.close(CloseReason::HandshakeFailed);
            return Err(BusError::Transport(format!(
                "session for {} is not usable",
                self.id
            )));
        }
        *state = ConnectionState::Open;
        Ok(())
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Enqueue a frame for transmission.
    pub fn send(&self, frame: Arc<String>) -> Result<(), BusError> {
        if !self.is_open() {
            return Err(BusError::connection_closed(&self.id));
        }
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(BusError::SendQueueFull {
                    connection: self.id.to_string(),
                })
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(BusError::connection_closed(&self.id))
            }
        }
    }

    /// Encode an envelope and enqueue it.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.send(Arc::new(envelope.encode()?))
    }

    /// Install the frame-received callback, replacing any previous one.
    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.on_receive.lock() = Some(Arc::new(callback));
    }

    /// Hand an inbound frame to the receive callback.
    ///
    /// Returns `false` when the frame was dropped (not open, or no callback).
    pub fn receive(&self, frame: String) -> bool {
        if !self.is_open() {
            debug!(conn_id = %self.id, "dropping frame on non-open connection");
            return false;
        }
        let callback = self.on_receive.lock().clone();
        match callback {
            Some(callback) => {
                callback(frame);
                true
            }
            None => {
                debug!(conn_id = %self.id, "no receive callback, dropping frame");
                false
            }
        }
    }

    /// Register a close notification. Fires exactly once; fires immediately
    /// if the connection is already closed.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce(&ConnectionId, CloseReason) + Send + 'static,
    {
        let mut callbacks = self.on_close.lock();
        let reason = *self.close_reason.lock();
        match reason {
            Some(reason) => {
                drop(callbacks);
                callback(&self.id, reason);
            }
            None => callbacks.push(Box::new(callback)),
        }
    }

    /// Close the connection. Idempotent: returns `false` if it was already
    /// closing or closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return false,
                ConnectionState::Open => {
                    *state = ConnectionState::Closing;
                    // Best-effort flush: the writer drains queued frames up to
                    // this marker before closing the transport.
                    let _ = self.tx.try_send(Outbound::Close);
                }
                ConnectionState::Connecting => {}
            }
        }

        let callbacks = {
            let mut callbacks = self.on_close.lock();
            *self.close_reason.lock() = Some(reason);
            std::mem::take(&mut *callbacks)
        };
        *self.state.lock() = ConnectionState::Closed;
        let _ = self.on_receive.lock().take();
        self.closed.cancel();

        debug!(conn_id = %self.id, reason = reason.as_str(), "connection closed");
        for callback in callbacks {
            callback(&self.id, reason);
        }
        true
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Token cancelled when the connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Mark the connection as alive (pong or any inbound activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Total frames that could not be enqueued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn make_connection() -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Connection::open(ConnectionId::from_raw("conn_1"), tx).unwrap();
        (conn, rx)
    }

    fn expect_frame(outbound: Option<Outbound>) -> String {
        match outbound {
            Some(Outbound::Frame(frame)) => frame.to_string(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn new_connection_is_connecting() {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Connection::new(ConnectionId::new(), tx);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.send(Arc::new("x".into())).is_err());
    }

    #[test]
    fn open_moves_to_open() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.id().as_str(), "conn_1");
    }

    #[test]
    fn open_on_dead_session_fails_and_notifies() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let conn = Connection::new(ConnectionId::new(), tx);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        conn.on_close(move |_, reason| {
            assert_eq!(reason, CloseReason::HandshakeFailed);
            let _ = fired2.fetch_add(1, Ordering::SeqCst);
        });
        let err = conn.establish().unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_enqueues_frames_in_order() {
        let (conn, mut rx) = make_connection();
        for i in 0..5 {
            conn.send(Arc::new(format!("msg_{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(expect_frame(rx.recv().await), format!("msg_{i}"));
        }
    }

    #[tokio::test]
    async fn send_envelope_encodes_json() {
        let (conn, mut rx) = make_connection();
        conn.send_envelope(&Envelope::new("say", serde_json::json!({"text": "hi"})))
            .unwrap();
        let frame = expect_frame(rx.recv().await);
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["eventName"], "say");
        assert_eq!(parsed["payload"]["text"], "hi");
    }

    #[test]
    fn send_to_full_queue_counts_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::open(ConnectionId::new(), tx).unwrap();
        conn.send(Arc::new("one".into())).unwrap();
        let err = conn.send(Arc::new("two".into())).unwrap_err();
        assert_eq!(err.error_kind(), "send_queue_full");
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_after_close_fails() {
        let (conn, _rx) = make_connection();
        assert!(conn.close(CloseReason::Normal));
        let err = conn.send(Arc::new("late".into())).unwrap_err();
        assert_eq!(err, BusError::connection_closed("conn_1"));
    }

    #[tokio::test]
    async fn close_flushes_pending_frames_before_marker() {
        let (conn, mut rx) = make_connection();
        conn.send(Arc::new("pending".into())).unwrap();
        let _ = conn.close(CloseReason::Normal);
        assert_eq!(expect_frame(rx.recv().await), "pending");
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
    }

    #[test]
    fn close_is_idempotent_and_notifies_once() {
        let (conn, _rx) = make_connection();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        conn.on_close(move |_, _| {
            let _ = fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(conn.close(CloseReason::Remote));
        assert!(!conn.close(CloseReason::Normal));
        assert!(!conn.close(CloseReason::Shutdown));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(conn.close_reason(), Some(CloseReason::Remote));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn on_close_after_close_fires_immediately() {
        let (conn, _rx) = make_connection();
        let _ = conn.close(CloseReason::TransportLost);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        conn.on_close(move |id, reason| {
            assert_eq!(id.as_str(), "conn_1");
            assert_eq!(reason, CloseReason::TransportLost);
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn receive_invokes_latest_callback_only() {
        let (conn, _rx) = make_connection();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        conn.on_receive(move |_| {
            let _ = f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        conn.on_receive(move |_| {
            let _ = s.fetch_add(1, Ordering::SeqCst);
        });
        assert!(conn.receive("frame".into()));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn receive_without_callback_drops() {
        let (conn, _rx) = make_connection();
        assert!(!conn.receive("frame".into()));
    }

    #[test]
    fn receive_after_close_drops() {
        let (conn, _rx) = make_connection();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        conn.on_receive(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        let _ = conn.close(CloseReason::Normal);
        assert!(!conn.receive("frame".into()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_future_resolves() {
        let (conn, _rx) = make_connection();
        let waiter = conn.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        let _ = conn.close(CloseReason::Normal);
        handle.await.unwrap();
        assert!(conn.closed_token().is_cancelled());
    }

    #[test]
    fn mark_alive_and_check() {
        let (conn, _rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn connection_age_increases() {
        let (conn, _rx) = make_connection();
        let age1 = conn.age();
        std::thread::sleep(Duration::from_millis(10));
        assert!(conn.age() > age1);
    }

    #[test]
    fn close_reason_strings() {
        assert_eq!(CloseReason::HeartbeatTimeout.as_str(), "heartbeat_timeout");
        assert_eq!(CloseReason::Shutdown.as_str(), "shutdown");
    }
}
