use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use courier_core::ConnectionId;
use courier_telemetry::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REJECTED_TOTAL, WS_CONNECTIONS_TOTAL,
    WS_CONNECTION_DURATION_SECONDS, WS_DISCONNECTIONS_TOTAL,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{health_check, HealthResponse};
use crate::registry::WorkerRegistry;
use crate::session::{run_session, SessionConfig};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<WorkerRegistry>,
    session: Arc<SessionConfig>,
    idle_timeout: Duration,
    max_connections: usize,
    active_sessions: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    metrics: PrometheusHandle,
    start_time: Instant,
}

/// The broadcast server: registry, HTTP routes and shutdown wiring.
pub struct CourierServer {
    config: ServerConfig,
    state: AppState,
    coordinator: Arc<ShutdownCoordinator>,
}

impl CourierServer {
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let state = AppState {
            registry: Arc::new(WorkerRegistry::new()),
            session: Arc::new(config.session_config()),
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            shutdown: coordinator.token(),
            metrics,
            start_time: Instant::now(),
        };
        Self {
            config,
            state,
            coordinator,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.token()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_handler))
            .route("/ws", get(ws_handler))
            .route("/broadcast", get(broadcast_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve in a background task.
    ///
    /// The task ends once shutdown is initiated and in-flight HTTP requests
    /// finish.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "courier server listening");

        let router = self.router();
        let token = self.coordinator.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "http server failed");
            }
        });
        Ok((local_addr, handle))
    }

    /// Stop accepting sessions and stop every worker.
    ///
    /// Only the first call does any work; later calls return `false`.
    pub async fn shutdown(&self) -> bool {
        if !self.coordinator.initiate() {
            return false;
        }
        self.state.registry.stop_all().await;
        true
    }

    /// Shut down, then wait for `tasks` within the configured timeout.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>) -> bool {
        let _ = self.shutdown().await;
        self.coordinator
            .graceful_shutdown(tasks, self.config.shutdown_timeout())
            .await
    }
}

/// Occupies one session slot until dropped.
struct SessionSlot(Arc<AtomicUsize>);

impl SessionSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(Arc::clone(active)))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_cancelled() {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "shutting_down").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let Some(slot) = SessionSlot::acquire(&state.active_sessions, state.max_connections) else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        warn!(max = state.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, state: AppState, slot: SessionSlot) {
    let connection_id = ConnectionId::new();
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(connection_id = %connection_id, "websocket connected");

    let (sink, source) = websocket::split(socket, state.idle_timeout);
    let result = run_session(
        connection_id.clone(),
        sink,
        source,
        Arc::clone(&state.registry),
        &state.session,
        state.shutdown.clone(),
    )
    .await;

    match result {
        Ok(summary) => {
            counter!(WS_DISCONNECTIONS_TOTAL, "reason" => summary.end.as_str()).increment(1);
            info!(
                connection_id = %connection_id,
                received = summary.received,
                reason = summary.end.as_str(),
                "websocket disconnected"
            );
        }
        Err(e) => {
            counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => e.error_kind()).increment(1);
            warn!(connection_id = %connection_id, error = %e, "websocket session failed to start");
        }
    }

    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    drop(slot);
}

#[derive(Debug, Deserialize)]
struct BroadcastParams {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub recipients: usize,
}

async fn broadcast_handler(
    State(state): State<AppState>,
    Query(params): Query<BroadcastParams>,
) -> Json<BroadcastResponse> {
    let recipients = state.registry.broadcast(params.message);
    info!(recipients, "broadcast requested");
    Json(BroadcastResponse { recipients })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.count(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        courier_telemetry::metrics::render(&state.metrics),
    )
}
