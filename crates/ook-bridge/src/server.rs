//! `BridgeServer`: Axum HTTP + WebSocket front end for the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use ook_telemetry::{MetricSample, MetricsRecorder, Telemetry};
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse, Uptime};
use crate::session::{SessionController, SessionEvent, SessionStatus};
use crate::shutdown::{ShutdownCoordinator, DEFAULT_DRAIN_TIMEOUT};
use crate::websocket;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    sessions: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    metrics: Arc<MetricsRecorder>,
    heartbeat: Duration,
    uptime: Uptime,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// The bridge server, before it starts listening.
pub struct BridgeServer {
    config: BridgeConfig,
    controller: SessionController,
    state: AppState,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig, telemetry: Telemetry) -> Self {
        let (sessions, events) = mpsc::unbounded_channel();
        let metrics = Arc::clone(&telemetry.metrics);
        let controller = SessionController::new(config.clone(), telemetry);
        let state = AppState {
            sessions,
            status: controller.subscribe(),
            metrics,
            heartbeat: config.heartbeat_interval(),
            uptime: Uptime::start(),
        };
        Self {
            config,
            controller,
            state,
            events,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the listener, start the session controller and serve until
    /// [`ServerHandle::shutdown`].
    pub async fn listen(self) -> Result<ServerHandle, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let router = self.router();
        let BridgeServer {
            config,
            controller,
            state,
            events,
        } = self;

        let mut shutdown = ShutdownCoordinator::new();
        let token = shutdown.token();
        let listener_task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                token.cancelled().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "server stopped with error");
            }
        });
        shutdown.track("listener", listener_task);
        shutdown.track("session", tokio::spawn(controller.run(events)));

        info!(
            addr = %local_addr,
            command = %config.agent.command,
            resume_policy = ?config.resume_policy,
            "ook bridge listening"
        );

        Ok(ServerHandle {
            addr: local_addr,
            sessions: state.sessions,
            status: state.status,
            shutdown,
        })
    }
}

/// Handle returned by [`BridgeServer::listen`]. Keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    sessions: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    shutdown: ShutdownCoordinator,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Latest published session status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Close the peer, stop the agent process, then stop the listener.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        let (done_tx, done_rx) = oneshot::channel();
        let delivered = self
            .sessions
            .send(SessionEvent::Shutdown { done: done_tx })
            .is_ok();
        let stopped = delivered && done_rx.await.is_ok();
        drop(self.sessions);

        let aborted = self.shutdown.drain(DEFAULT_DRAIN_TIMEOUT).await;
        info!(?aborted, "ook bridge stopped");

        if stopped {
            Ok(())
        } else {
            Err(ServerError::ControllerGone)
        }
    }
}

/// GET / and GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state.sessions, state.heartbeat))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let session = state.status.borrow().clone();
    Json(health::health_check(&state.uptime, &session))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Json<Vec<MetricSample>> {
    Json(state.metrics.snapshot())
}
