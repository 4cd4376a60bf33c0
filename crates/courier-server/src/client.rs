//! Peer-side handle: the initiating end of the same protocol.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use courier_core::envelope::validate_event_name;
use courier_core::{BusError, ConnectionId, DiagnosticsSink, Envelope, Incident};
use courier_telemetry::TracingSink;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument};

use crate::config::ClientConfig;
use crate::connection::{CloseReason, Connection, ConnectionState, Outbound};
use crate::handler::{handler_fn, EventHandler, HandlerResult};
use crate::message::Message;
use crate::peers::PeerSet;
use crate::router::Router;
use crate::subscriptions::{SubscriptionHandle, SubscriptionTable};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for queued frames to reach the socket.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to a bus from the client side.
///
/// Inbound messages are dispatched through a local router, so handlers see
/// the same `Message` type and ordering guarantee as on the server.
pub struct ClientHandle {
    url: String,
    connection: Arc<Connection>,
    router: Router,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl ClientHandle {
    /// Connect with default settings.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        Self::connect_with(url, ClientConfig::default()).await
    }

    pub async fn connect_with(url: &str, config: ClientConfig) -> Result<Self, BusError> {
        Self::connect_with_diagnostics(url, config, Arc::new(TracingSink)).await
    }

    /// Perform the handshake and start the transport tasks.
    ///
    /// Any handshake failure is `ConnectionFailed`; there is no retry.
    #[instrument(skip(config, diagnostics))]
    pub async fn connect_with_diagnostics(
        url: &str,
        config: ClientConfig,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self, BusError> {
        let failed = |reason: String| BusError::ConnectionFailed {
            url: url.to_string(),
            reason,
        };
        let (ws, _response) = tokio::time::timeout(config.connect_timeout(), connect_async(url))
            .await
            .map_err(|_| failed(format!("timed out after {:?}", config.connect_timeout())))?
            .map_err(|e| failed(e.to_string()))?;

        let (ws_tx, ws_rx) = ws.split();
        let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let connection =
            Connection::open(ConnectionId::new(), tx).map_err(|e| failed(e.to_string()))?;

        let peers = Arc::new(PeerSet::new());
        peers.add(connection.clone());
        let router = Router::new(Arc::new(SubscriptionTable::new()), peers.clone(), diagnostics);
        connection.on_close(move |id, reason| {
            let _ = peers.remove(id);
            debug!(conn_id = %id, reason = reason.as_str(), "client connection closed");
        });

        let dispatcher = router.attach(&connection, config.max_pending_frames);
        let writer = tokio::spawn(write_outbound(ws_tx, rx, connection.clone()));
        let reader = tokio::spawn(read_inbound(ws_rx, connection.clone(), router.clone()));
        info!(conn_id = %connection.id(), "connected");

        Ok(Self {
            url: url.to_string(),
            connection,
            router,
            writer: Mutex::new(Some(writer)),
            reader,
            dispatcher,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.connection.close_reason()
    }

    /// Register a handler for messages arriving from the bus.
    pub fn on<F, Fut>(&self, event_name: &str, f: F) -> SubscriptionHandle
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_handler(event_name, handler_fn(f))
    }

    pub fn on_handler(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        self.router.table().register(event_name, handler)
    }

    pub fn off(&self, handle: &SubscriptionHandle) -> bool {
        self.router.table().unregister(handle)
    }

    /// Fire-and-forget send of a named message.
    pub fn emit(&self, event_name: &str, payload: Value) -> Result<(), BusError> {
        validate_event_name(event_name)?;
        self.connection.send_envelope(&Envelope::new(event_name, payload))
    }

    /// Like [`emit`](Self::emit) with any serializable payload.
    pub fn emit_json<T: Serialize + ?Sized>(
        &self,
        event_name: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        validate_event_name(event_name)?;
        self.connection.send_envelope(&Envelope::with_payload(event_name, payload)?)
    }

    /// Close gracefully, flushing queued frames first. Idempotent.
    pub async fn close(&self) {
        let _ = self.connection.close(CloseReason::Normal);
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }

    /// Resolves once the connection has closed for any reason.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        let _ = self.connection.close(CloseReason::Normal);
        self.reader.abort();
        self.dispatcher.abort();
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("url", &self.url)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

async fn write_outbound(
    mut ws_tx: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
) {
    let closed = connection.closed_token();
    loop {
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(Outbound::Frame(text)) => {
                    if ws_tx.send(WsMessage::text(text.as_str().to_owned())).await.is_err() {
                        let _ = connection.close(CloseReason::TransportLost);
                        return;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            () = closed.cancelled() => {
                while let Ok(Outbound::Frame(text)) = rx.try_recv() {
                    if ws_tx.send(WsMessage::text(text.as_str().to_owned())).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = ws_tx.send(WsMessage::Close(None)).await;
    let _ = ws_tx.close().await;
}

async fn read_inbound(
    mut ws_rx: SplitStream<WsStream>,
    connection: Arc<Connection>,
    router: Router,
) {
    let closed = connection.closed_token();
    let reason = loop {
        tokio::select! {
            () = closed.cancelled() => break None,
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "read failed");
                        break Some(CloseReason::TransportLost);
                    }
                    None => break Some(CloseReason::TransportLost),
                };
                connection.mark_alive();
                match msg {
                    WsMessage::Text(text) => {
                        let _ = connection.receive(text.to_string());
                    }
                    WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            let _ = connection.receive(text);
                        }
                        Err(_) => {
                            let err = BusError::MalformedFrame(format!(
                                "non-UTF-8 binary frame ({} bytes)",
                                data.len()
                            ));
                            router.report(Incident::new(connection.id(), None, &err));
                        }
                    },
                    WsMessage::Close(_) => break Some(CloseReason::Remote),
                    _ => {}
                }
            }
        }
    };
    if let Some(reason) = reason {
        let _ = connection.close(reason);
    }
}
