//! HealthMonitor - 読み取り専用の HTTP 監視面
//!
//! - `GET /status`: engine state, workers, queue snapshot, last reconciliation
//! - `GET /health`: liveness (200 / 503)
//! - `GET /tasks`: in-flight tasks and recent outcomes
//! - `POST /control/stop`: only signals the process owner; touches no engine state
//!
//! Handlers read the `StatusBoard` and the queue gauges; never the queue lock.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::status::{EngineStatus, Liveness, StatusBoard, TasksView};
use crate::ports::Clock;
use crate::queue::QueueGauges;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct MonitorState {
    pub board: Arc<StatusBoard>,
    pub gauges: Arc<QueueGauges>,
    pub clock: Arc<dyn Clock>,
    pub shutdown_requested: CancellationToken,
    pub liveness_timeout: chrono::Duration,

    /// Longest a busy worker can legitimately go without a heartbeat.
    pub busy_allowance: chrono::Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAccepted {
    pub stopping: bool,
}

pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/tasks", get(tasks))
        .route("/control/stop", post(request_stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<MonitorState>) -> Json<EngineStatus> {
    let now = state.clock.now();
    Json(state.board.snapshot(now, state.gauges.snapshot(now)))
}

async fn health(State(state): State<MonitorState>) -> (StatusCode, Json<Liveness>) {
    let liveness = state
        .board
        .liveness(state.clock.now(), state.liveness_timeout, state.busy_allowance);
    let code = if liveness.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(liveness))
}

async fn tasks(State(state): State<MonitorState>) -> Json<TasksView> {
    Json(state.board.tasks())
}

async fn request_stop(State(state): State<MonitorState>) -> (StatusCode, Json<StopAccepted>) {
    info!("stop requested over HTTP");
    state.shutdown_requested.cancel();
    (StatusCode::ACCEPTED, Json(StopAccepted { stopping: true }))
}

/// Running HTTP listener.
pub struct HealthServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    join: JoinHandle<std::io::Result<()>>,
}

impl HealthServer {
    pub async fn bind(addr: SocketAddr, state: MonitorState) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let app = router(state);

        let join = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .into_future(),
        );
        info!("health monitor listening on http://{}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            join,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections; give open ones a short drain period.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut self.join).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "health monitor exited with error"),
            Ok(Err(e)) => warn!(error = %e, "health monitor task failed"),
            Err(_) => {
                warn!("health monitor did not drain in time, aborting");
                self.join.abort();
            }
        }
    }
}
