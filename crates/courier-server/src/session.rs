//! Server-side WebSocket session: one accepted peer from upgrade to teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use courier_core::{BusError, ConnectionId, Incident};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::BusShared;
use crate::connection::{CloseReason, Connection, Outbound};

/// How long the writer may keep flushing after the connection closed.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a session for an upgraded socket.
///
/// 1. Opens a [`Connection`] and admits it to the bus
/// 2. Forwards outbound frames and periodic pings from a writer task
/// 3. Feeds inbound text (and UTF-8 binary) frames to the connection
/// 4. Closes the connection with the reason the loop ended on
#[instrument(skip_all, fields(conn_id = %id))]
pub(crate) async fn run_session(
    ws: WebSocket,
    id: ConnectionId,
    shared: Arc<BusShared>,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel(shared.config().send_queue_capacity);

    let connection = match Connection::open(id, tx) {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "session unusable");
            return;
        }
    };
    let dispatcher = shared.admit(&connection);
    info!("peer connected");

    let mut writer = tokio::spawn(write_outbound(
        ws_tx,
        rx,
        connection.clone(),
        shared.config().ping_interval(),
        shared.config().pong_timeout(),
    ));

    let closed = connection.closed_token();
    let reason = loop {
        tokio::select! {
            () = closed.cancelled() => break None,
            () = shutdown.cancelled() => break Some(CloseReason::Shutdown),
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
                            shared.router().report(Incident::new(connection.id(), None, &err));
                        }
                    },
                    WsMessage::Close(_) => {
                        debug!("peer sent close frame");
                        break Some(CloseReason::Remote);
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                }
            }
        }
    };
    if let Some(reason) = reason {
        let _ = connection.close(reason);
    }

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!("writer did not drain in time, aborting");
        writer.abort();
    }
    let _ = dispatcher.await;

    info!(
        reason = connection.close_reason().map(|r| r.as_str()).unwrap_or("unknown"),
        age_secs = connection.age().as_secs(),
        dropped = connection.drop_count(),
        "peer disconnected"
    );
}

/// Drain the outbound queue onto the socket and keep the peer honest with pings.
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let closed = connection.closed_token();
    let mut ping = tokio::time::interval(ping_interval);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(Outbound::Frame(text)) => {
                    if ws_tx.send(WsMessage::Text(text.as_str().to_owned().into())).await.is_err() {
                        let _ = connection.close(CloseReason::TransportLost);
                        return;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            () = closed.cancelled() => {
                // The close marker may not have fit in a full queue.
                while let Ok(Outbound::Frame(text)) = rx.try_recv() {
                    if ws_tx.send(WsMessage::Text(text.as_str().to_owned().into())).await.is_err() {
                        return;
                    }
                }
                break;
            }
            _ = ping.tick() => {
                if !connection.check_alive() && connection.last_pong_elapsed() > pong_timeout {
                    warn!(
                        conn_id = %connection.id(),
                        "peer unresponsive for {pong_timeout:?}, disconnecting"
                    );
                    let _ = connection.close(CloseReason::HeartbeatTimeout);
                    break;
                }
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    let _ = connection.close(CloseReason::TransportLost);
                    return;
                }
            }
        }
    }

    let _ = ws_tx.send(WsMessage::Close(None)).await;
    let _ = ws_tx.close().await;
}
