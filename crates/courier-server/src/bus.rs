//! The server-side bus: listener lifecycle, session admission, handler API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router as HttpRouter};
use courier_core::envelope::validate_event_name;
use courier_core::{BusError, ConnectionId, DiagnosticsSink, Envelope};
use courier_telemetry::TracingSink;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::BusConfig;
use crate::connection::{CloseReason, Connection};
use crate::handler::{handler_fn, EventHandler, HandlerResult};
use crate::health::health_check;
use crate::message::Message;
use crate::peers::{DeliveryReport, PeerSet};
use crate::router::Router;
use crate::session::run_session;
use crate::shutdown::ShutdownCoordinator;
use crate::subscriptions::{SubscriptionHandle, SubscriptionTable};

type ConnectionHook = Arc<dyn Fn(ConnectionScope) + Send + Sync>;

/// Per-connection view handed to `on_connection` hooks.
///
/// Handlers registered here only see messages from this connection and are
/// dropped when it closes.
#[derive(Clone)]
pub struct ConnectionScope {
    connection: Arc<Connection>,
    table: Arc<SubscriptionTable>,
}

impl ConnectionScope {
    pub fn id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

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
        let handle = self.table.register_scoped(self.connection.id(), event_name, handler);
        // Closed between admission and now: the purge already ran.
        if !self.connection.is_open() {
            let _ = self.table.unregister(&handle);
        }
        handle
    }

    /// Send a message to this connection only.
    pub fn emit(&self, event_name: &str, payload: Value) -> Result<(), BusError> {
        validate_event_name(event_name)?;
        self.connection.send_envelope(&Envelope::new(event_name, payload))
    }

    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce(&ConnectionId, CloseReason) + Send + 'static,
    {
        self.connection.on_close(callback);
    }
}

/// State shared between the bus value and its sessions.
pub(crate) struct BusShared {
    config: BusConfig,
    router: Router,
    hooks: RwLock<Vec<ConnectionHook>>,
}

impl BusShared {
    pub(crate) fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Register an opened connection with the bus.
    ///
    /// Adds it to the peer set, wires its frames into the router, arranges
    /// for close to purge it, then runs connection hooks. Returns the
    /// dispatcher task.
    pub(crate) fn admit(&self, connection: &Arc<Connection>) -> JoinHandle<()> {
        let peers = self.router.peers().clone();
        let table = self.router.table().clone();
        peers.add(connection.clone());
        connection.on_close(move |id, reason| {
            let _ = peers.remove(id);
            let purged = table.remove_all_for(id);
            debug!(conn_id = %id, reason = reason.as_str(), purged, "connection purged");
        });

        let dispatcher = self
            .router
            .attach(connection, self.config.max_pending_frames);

        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook(ConnectionScope {
                connection: connection.clone(),
                table: self.router.table().clone(),
            });
        }
        dispatcher
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
struct AppState {
    shared: Arc<BusShared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: Instant,
}

struct Listening {
    addr: SocketAddr,
    coordinator: ShutdownCoordinator,
    server: JoinHandle<()>,
}

/// A named-event message bus.
///
/// Owns its subscription table, peer set and listener. Nothing is shared
/// between two buses.
pub struct Bus {
    shared: Arc<BusShared>,
    listening: Mutex<Option<Listening>>,
}

impl Bus {
    /// A bus that reports incidents through `tracing`.
    pub fn new(config: BusConfig) -> Self {
        Self::with_diagnostics(config, Arc::new(TracingSink))
    }

    pub fn with_diagnostics(config: BusConfig, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        let router = Router::new(
            Arc::new(SubscriptionTable::new()),
            Arc::new(PeerSet::new()),
            diagnostics,
        );
        Self {
            shared: Arc::new(BusShared {
                config,
                router,
                hooks: RwLock::new(Vec::new()),
            }),
            listening: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Bind `config.host:port` and start accepting sessions.
    ///
    /// Port `0` picks a free port; the bound address is returned.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, BusError> {
        if let Some(listening) = self.listening.lock().as_ref() {
            return Err(BusError::AlreadyListening {
                addr: listening.addr.to_string(),
            });
        }
        self.shared.config.validate()?;

        let bind_addr = format!("{}:{}", self.shared.config.host, port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| BusError::Bind {
            addr: bind_addr.clone(),
            reason: e.to_string(),
        })?;
        let addr = listener.local_addr().map_err(|e| BusError::Bind {
            addr: bind_addr,
            reason: e.to_string(),
        })?;

        let coordinator = ShutdownCoordinator::new();
        let state = AppState {
            shared: self.shared.clone(),
            shutdown: coordinator.token(),
            tracker: coordinator.tracker(),
            started: Instant::now(),
        };
        let app = HttpRouter::new()
            .route(&self.shared.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http());

        let token = coordinator.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "listener failed");
            }
        });

        let mut slot = self.listening.lock();
        if let Some(existing) = slot.as_ref() {
            coordinator.shutdown();
            return Err(BusError::AlreadyListening {
                addr: existing.addr.to_string(),
            });
        }
        *slot = Some(Listening {
            addr,
            coordinator,
            server,
        });
        info!(%addr, path = %self.shared.config.path, "bus listening");
        Ok(addr)
    }

    /// Register a handler for `event_name` on every connection.
    ///
    /// Applies to messages received from now on, before or after `listen`.
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
        self.shared.router.table().register(event_name, handler)
    }

    /// Remove a registration. Returns `false` if it was already removed.
    pub fn off(&self, handle: &SubscriptionHandle) -> bool {
        self.shared.router.table().unregister(handle)
    }

    /// Run `hook` for every connection admitted from now on.
    pub fn on_connection<F>(&self, hook: F)
    where
        F: Fn(ConnectionScope) + Send + Sync + 'static,
    {
        self.shared.hooks.write().push(Arc::new(hook));
    }

    /// Broadcast a server-originated message to every open connection.
    pub fn publish(&self, event_name: &str, payload: Value) -> Result<DeliveryReport, BusError> {
        validate_event_name(event_name)?;
        Ok(self.shared.router.publish(&Envelope::new(event_name, payload), None))
    }

    /// Send a message to one connection.
    pub fn send_to(
        &self,
        connection: &ConnectionId,
        event_name: &str,
        payload: Value,
    ) -> Result<(), BusError> {
        validate_event_name(event_name)?;
        self.shared.router.send_to(connection, &Envelope::new(event_name, payload))
    }

    pub fn connection_count(&self) -> usize {
        self.shared.router.peers().count()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.router.peers().ids()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        self.shared.router.table()
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().as_ref().map(|l| l.addr)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.lock().is_some()
    }

    /// Stop accepting, close every connection, and wait for sessions to end.
    ///
    /// Idempotent. The bus may `listen` again afterwards.
    pub async fn shutdown(&self) {
        let Some(listening) = self.listening.lock().take() else {
            debug!("shutdown on a bus that is not listening");
            return;
        };
        let timeout = self.shared.config.shutdown_timeout();

        listening.coordinator.shutdown();
        let mut closed = 0;
        for connection in self.shared.router.peers().snapshot() {
            if connection.close(CloseReason::Shutdown) {
                closed += 1;
            }
        }
        let drained = listening.coordinator.graceful_shutdown(timeout).await;
        let remaining = listening.coordinator.active_tasks();

        let mut server = listening.server;
        if tokio::time::timeout(timeout, &mut server).await.is_err() {
            server.abort();
        }
        info!(addr = %listening.addr, closed, drained, remaining, "bus shut down");
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if let Some(listening) = self.listening.get_mut().take() {
            listening.coordinator.shutdown();
            for connection in self.shared.router.peers().snapshot() {
                let _ = connection.close(CloseReason::Shutdown);
            }
            listening.server.abort();
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "bus is shutting down").into_response();
    }
    let config = &state.shared.config;
    if state.shared.router.peers().count() >= config.max_connections {
        debug!(limit = config.max_connections, "refusing upgrade, connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let max_message_size = config.max_message_size;
    let AppState {
        shared,
        shutdown,
        tracker,
        ..
    } = state;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            tracker.track_future(run_session(socket, ConnectionId::new(), shared, shutdown))
        })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(health_check(
        state.started,
        state.shared.router.peers().count(),
        state.shared.router.table().event_names().len(),
    ))
}
