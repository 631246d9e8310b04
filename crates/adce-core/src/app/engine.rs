//! Engine - ライフサイクル制御
//!
//! STOPPED → STARTING → RUNNING → STOPPING → STOPPED
//!
//! 起動順: HealthMonitor → Reconciler → Executor
//! 停止順: Reconciler → Executor (grace) → in-flight 回収 → HealthMonitor

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::monitor::{HealthServer, MonitorState};
use super::rate_limit::RateLimiters;
use super::reconciler_loop::{PassReport, ReconcileError, Reconciler};
use super::registry::SourceRegistry;
use super::status::{EngineState, EngineStatus, StatusBoard, TasksView};
use super::worker_loop::{Executor, WorkerGroup};
use crate::config::EngineConfig;
use crate::domain::{EntityRef, PriorityClass, SourceId, Task};
use crate::ports::{ActualInventory, Clock, ExpectedInventory, IdGenerator, Persistence};
use crate::queue::{QueueError, RetryPolicy, TaskQueue};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        state: EngineState,
        action: &'static str,
    },

    #[error("health monitor: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of `Engine::stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Every worker finished its task within the grace period.
    pub graceful: bool,
    pub forced_workers: usize,

    /// In-flight tasks returned to PENDING.
    pub released_tasks: usize,
    pub elapsed_ms: u64,
}

/// Handles owned only while the engine runs.
struct Running {
    server: HealthServer,
    reconcile_stop: CancellationToken,
    reconcile_join: JoinHandle<()>,
    workers: WorkerGroup,
}

pub struct Engine {
    config: EngineConfig,
    queue: Arc<TaskQueue>,
    board: Arc<StatusBoard>,
    reconciler: Arc<Reconciler>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    shutdown_requested: CancellationToken,
    running: Mutex<Option<Running>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Engine {
    /// Wire the components. Use `EngineBuilder` instead of calling this directly.
    pub(crate) fn from_parts(
        config: EngineConfig,
        registry: SourceRegistry,
        expected: Arc<dyn ExpectedInventory>,
        actual: Arc<dyn ActualInventory>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let board = Arc::new(StatusBoard::new(
            config.monitor.recent_capacity,
            config.monitor.recent_window(),
        ));
        let queue = Arc::new(TaskQueue::new(
            RetryPolicy::from_config(&config.retry),
            Arc::clone(&clock),
            Arc::clone(&persistence),
        ));
        let reconciler = Arc::new(Reconciler::new(
            expected,
            actual,
            Arc::clone(&queue),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&board),
            config.reconcile.clone(),
            config.priority.clone(),
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&queue),
            Arc::new(registry),
            Arc::new(RateLimiters::from_config(&config.sources)),
            persistence,
            Arc::clone(&board),
            Arc::clone(&clock),
            config.executor.clone(),
        ));

        Self {
            config,
            queue,
            board,
            reconciler,
            executor,
            clock,
            ids,
            shutdown_requested: CancellationToken::new(),
            running: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.board.state()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    /// Cancelled by `POST /control/stop`. The process owner decides when to `stop`.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown_requested.clone()
    }

    /// Bound address of the health monitor while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.read().ok().and_then(|addr| *addr)
    }

    pub fn status(&self) -> EngineStatus {
        let now = self.clock.now();
        self.board.snapshot(now, self.queue.snapshot())
    }

    pub fn tasks(&self) -> TasksView {
        self.board.tasks()
    }

    /// Build a task for an external trigger, for use with `submit`.
    pub fn new_task(&self, source: SourceId, entity_ref: EntityRef, class: PriorityClass) -> Task {
        Task::new(self.ids.generate_task_id(), source, entity_ref, class, self.clock.now())
    }

    /// Enqueue through the same path the Reconciler uses. `Ok(false)` = merged.
    pub async fn submit(&self, task: Task) -> Result<bool, QueueError> {
        self.queue.enqueue(task).await
    }

    /// Run one reconciliation pass outside the timer.
    pub async fn reconcile_now(&self) -> Result<PassReport, ReconcileError> {
        let cancel = match self.running.lock().await.as_ref() {
            Some(running) => running.reconcile_stop.child_token(),
            None => CancellationToken::new(),
        };
        self.reconciler.reconcile_once(&cancel).await
    }

    /// Start the health monitor, then the reconciler, then the workers.
    ///
    /// Returns the monitor's bound address.
    pub async fn start(&self) -> Result<SocketAddr, EngineError> {
        let mut running = self.running.lock().await;
        self.board
            .transition(EngineState::Stopped, EngineState::Starting)
            .map_err(|state| EngineError::InvalidTransition {
                state,
                action: "start",
            })?;

        let server = match self.bind_monitor().await {
            Ok(server) => server,
            Err(e) => {
                let _ = self
                    .board
                    .transition(EngineState::Starting, EngineState::Stopped);
                return Err(e.into());
            }
        };
        let addr = server.local_addr();
        self.board.set_started_at(Some(self.clock.now()));

        let reconcile_stop = CancellationToken::new();
        let reconcile_join = tokio::spawn(Arc::clone(&self.reconciler).run(reconcile_stop.clone()));
        let workers = self.executor.spawn();

        *running = Some(Running {
            server,
            reconcile_stop,
            reconcile_join,
            workers,
        });
        if let Ok(mut local) = self.local_addr.write() {
            *local = Some(addr);
        }
        let _ = self
            .board
            .transition(EngineState::Starting, EngineState::Running);
        info!(addr = %addr, workers = self.config.executor.workers, "engine running");
        Ok(addr)
    }

    /// Stop reconciliation, let workers finish for up to `grace`, cancel the
    /// rest, and return every in-flight task to PENDING.
    pub async fn stop(&self, grace: Duration) -> Result<StopReport, EngineError> {
        let mut running = self.running.lock().await;
        self.board
            .transition(EngineState::Running, EngineState::Stopping)
            .map_err(|state| EngineError::InvalidTransition {
                state,
                action: "stop",
            })?;
        let started = Instant::now();
        let deadline = started + grace;
        info!(grace_ms = grace.as_millis() as u64, "engine stopping");

        let mut report = StopReport {
            graceful: true,
            forced_workers: 0,
            released_tasks: 0,
            elapsed_ms: 0,
        };

        if let Some(Running {
            server,
            reconcile_stop,
            mut reconcile_join,
            workers,
        }) = running.take()
        {
            reconcile_stop.cancel();
            if tokio::time::timeout_at(deadline, &mut reconcile_join).await.is_err() {
                warn!("reconciler did not stop in time, aborting");
                reconcile_join.abort();
            }

            let shutdown = workers
                .shutdown(deadline.saturating_duration_since(Instant::now()))
                .await;
            report.graceful = shutdown.graceful;
            report.forced_workers = shutdown.forced;

            report.released_tasks = self.queue.recover_in_flight().await;
            if report.released_tasks > 0 {
                warn!(tasks = report.released_tasks, "in-flight tasks returned to pending");
            }
            self.board.reset_workers(0);
            server.shutdown().await;
        }

        if let Ok(mut local) = self.local_addr.write() {
            *local = None;
        }
        self.board.set_started_at(None);
        let _ = self
            .board
            .transition(EngineState::Stopping, EngineState::Stopped);

        report.elapsed_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        info!(
            graceful = report.graceful,
            forced_workers = report.forced_workers,
            released_tasks = report.released_tasks,
            elapsed_ms = report.elapsed_ms,
            "engine stopped"
        );
        Ok(report)
    }

    async fn bind_monitor(&self) -> std::io::Result<HealthServer> {
        let addr: SocketAddr = self.config.monitor.listen.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("monitor.listen {}: {e}", self.config.monitor.listen),
            )
        })?;
        let state = MonitorState {
            board: Arc::clone(&self.board),
            gauges: self.queue.gauges(),
            clock: Arc::clone(&self.clock),
            shutdown_requested: self.shutdown_requested.clone(),
            liveness_timeout: self.config.monitor.liveness_timeout(),
            busy_allowance: self.config.executor.busy_allowance(),
        };
        HealthServer::bind(addr, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::EngineBuilder;
    use crate::impls::{InMemoryPersistence, StaticInventory};

    fn engine(listen: &str) -> Engine {
        let mut config = EngineConfig::default();
        config.monitor.listen = listen.to_string();
        config.executor.workers = 2;
        config.executor.poll_interval_ms = 20;
        let inventory = Arc::new(StaticInventory::default());
        EngineBuilder::new(config)
            .expected_inventory(inventory.clone())
            .actual_inventory(inventory)
            .persistence(Arc::new(InMemoryPersistence::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn start_then_stop_walks_the_state_machine() {
        let engine = engine("127.0.0.1:0");
        assert_eq!(engine.state(), EngineState::Stopped);

        let addr = engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.local_addr(), Some(addr));
        assert!(engine.status().started_at.is_some());
        assert_eq!(engine.status().workers.total, 2);

        let report = engine.stop(Duration::from_secs(1)).await.unwrap();
        assert!(report.graceful);
        assert_eq!(report.released_tasks, 0);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.local_addr(), None);
        assert!(engine.status().started_at.is_none());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = engine("127.0.0.1:0");
        engine.start().await.unwrap();
        let err = engine.start().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                state: EngineState::Running,
                action: "start"
            }
        ));
        engine.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_while_stopped_is_rejected() {
        let engine = engine("127.0.0.1:0");
        assert!(matches!(
            engine.stop(Duration::from_millis(10)).await,
            Err(EngineError::InvalidTransition {
                state: EngineState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn bind_failure_returns_to_stopped() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let engine = engine(&taken.local_addr().unwrap().to_string());

        assert!(matches!(engine.start().await, Err(EngineError::Io(_))));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn engine_can_restart_after_stop() {
        let engine = engine("127.0.0.1:0");
        engine.start().await.unwrap();
        engine.stop(Duration::from_millis(200)).await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn submitted_task_is_merged_by_key() {
        let engine = engine("127.0.0.1:0");
        let first = engine.new_task(SourceId::new("espn"), EntityRef::new("g1"), PriorityClass::Low);
        let second = engine.new_task(SourceId::new("espn"), EntityRef::new("g1"), PriorityClass::High);

        assert!(engine.submit(first).await.unwrap());
        assert!(!engine.submit(second).await.unwrap());
        assert_eq!(engine.queue().snapshot().total_pending, 1);
        assert_eq!(engine.queue().snapshot().depth.high, 1);
    }
}
