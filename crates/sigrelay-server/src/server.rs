//! `SignalServer`: axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::registry::RoomRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::status::{self, HealthResponse, RoomsResponse, ServiceInfo};
use crate::websocket::connection::ConnectionKey;
use crate::websocket::session::run_session;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Room registry.
    pub registry: Arc<RoomRegistry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    slots: Arc<Semaphore>,
}

/// The signaling server.
pub struct SignalServer {
    state: AppState,
}

impl SignalServer {
    /// Create a server with an empty registry.
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        let slots = config.max_connections.clamp(1, Semaphore::MAX_PERMITS);
        let registry = RoomRegistry::with_max_dropped_messages(config.max_dropped_messages);
        Self {
            state: AppState {
                registry: Arc::new(registry),
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics,
                start_time: Instant::now(),
                slots: Arc::new(Semaphore::new(slots)),
            },
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/rooms", get(rooms_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/{room_id}/{user_id}", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// The room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.state.registry
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(self.config().bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown().token();

        info!(%addr, "signaling server listening");

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "server terminated with error");
            }
        });

        Ok(ServerHandle { addr, task })
    }
}

/// A running listener.
pub struct ServerHandle {
    /// Address actually bound (resolves port 0).
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The serving task, for graceful shutdown.
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// GET /
async fn root_handler() -> Json<ServiceInfo> {
    Json(status::service_info())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(status::health_check(
        state.start_time,
        state.registry.connection_count(),
    ))
}

/// GET /rooms
async fn rooms_handler(State(state): State<AppState>) -> Json<RoomsResponse> {
    Json(status::rooms(state.registry.snapshot()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// GET /ws/{room_id}/{user_id}
async fn ws_handler(
    Path((room_id, user_id)): Path<(String, String)>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(
            %room_id,
            %user_id,
            limit = state.config.max_connections,
            "connection limit reached, rejecting upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let key = ConnectionKey::new(room_id, user_id);
    let registry = Arc::clone(&state.registry);
    let config = Arc::clone(&state.config);
    let token = state.shutdown.token();
    let sessions = state.shutdown.sessions().clone();

    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| debug!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            sessions.track_future(async move {
                let _permit = permit;
                let _ = run_session(socket, key, registry, config, token).await;
            })
        })
}
