//! Status - 監視用のスナップショット
//!
//! `StatusBoard` is written by the Executor, Reconciler and Engine and read
//! by the HealthMonitor. It has its own short-lived locks and never touches
//! the queue lock; readers always get copies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::reconciler_loop::PassReport;
use crate::domain::{EntityRef, ErrorClass, PriorityClass, SourceId, Task, TaskId, TaskStatus};
use crate::queue::QueueSnapshot;

/// Engine lifecycle: STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Stopped => 0,
            EngineState::Starting => 1,
            EngineState::Running => 2,
            EngineState::Stopping => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy {
        task_id: TaskId,
        source: SourceId,
        entity_ref: EntityRef,
        priority_class: PriorityClass,
        attempt: u32,
        since: DateTime<Utc>,
    },
}

/// Read-only copy of one worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: usize,
    #[serde(flatten)]
    pub state: WorkerState,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl WorkerSlot {
    fn idle(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: WorkerState::Idle,
            heartbeat: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, WorkerState::Busy { .. })
    }
}

/// One entry of the recent-outcome ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub source: SourceId,
    pub entity_ref: EntityRef,
    pub priority_class: PriorityClass,

    /// DONE, FAILED (requeued), ABANDONED, or PENDING (released).
    pub status: TaskStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskEvent {
    pub fn new(task: &Task, status: TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            source: task.source.clone(),
            entity_ref: task.entity_ref.clone(),
            priority_class: task.priority_class,
            status,
            attempt: task.attempt,
            at,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileFailure {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileView {
    pub in_progress: bool,
    pub last_pass: Option<PassReport>,
    pub last_success_at: Option<DateTime<Utc>>,

    /// Set by a failed pass, cleared by the next successful one.
    pub last_error: Option<ReconcileFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub completed: u64,
    pub requeued: u64,
    pub abandoned: u64,
    pub released: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub workers: WorkerSummary,
    pub queue: QueueSnapshot,
    pub last_reconciliation: ReconcileView,
    pub last_reconciliation_error: Option<ErrorClass>,
    pub abandoned_recent: usize,
    pub totals: Totals,
}

/// Body of `GET /tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksView {
    pub in_flight: Vec<WorkerSlot>,

    /// Newest first.
    pub recent: Vec<TaskEvent>,
}

/// Result of a liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    pub ok: bool,
    pub state: EngineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct StatusBoard {
    state: AtomicU8,
    started_at: RwLock<Option<DateTime<Utc>>>,
    workers: RwLock<Vec<WorkerSlot>>,
    recent: Mutex<VecDeque<TaskEvent>>,
    recent_capacity: usize,
    recent_window: Duration,
    abandoned_at: Mutex<VecDeque<DateTime<Utc>>>,
    reconcile: RwLock<ReconcileView>,
    completed: AtomicU64,
    requeued: AtomicU64,
    abandoned: AtomicU64,
    released: AtomicU64,
}

impl StatusBoard {
    pub fn new(recent_capacity: usize, recent_window: Duration) -> Self {
        Self {
            state: AtomicU8::new(EngineState::Stopped.as_u8()),
            started_at: RwLock::new(None),
            workers: RwLock::new(Vec::new()),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity: recent_capacity.max(1),
            recent_window,
            abandoned_at: Mutex::new(VecDeque::new()),
            reconcile: RwLock::new(ReconcileView::default()),
            completed: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    // ---- engine state ------------------------------------------------------

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Atomic `from -> to`. On mismatch returns the current state.
    pub fn transition(&self, from: EngineState, to: EngineState) -> Result<(), EngineState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(EngineState::from_u8)
    }

    pub fn set_started_at(&self, at: Option<DateTime<Utc>>) {
        *self.started_at.write().unwrap_or_else(PoisonError::into_inner) = at;
    }

    // ---- workers -----------------------------------------------------------

    pub fn reset_workers(&self, count: usize) {
        *self.workers.write().unwrap_or_else(PoisonError::into_inner) =
            (0..count).map(WorkerSlot::idle).collect();
    }

    fn with_slot(&self, worker_id: usize, f: impl FnOnce(&mut WorkerSlot)) {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = workers.get_mut(worker_id) {
            f(slot);
        }
    }

    pub fn heartbeat(&self, worker_id: usize, now: DateTime<Utc>) {
        self.with_slot(worker_id, |slot| slot.heartbeat = Some(now));
    }

    pub fn worker_busy(&self, worker_id: usize, task: &Task, now: DateTime<Utc>) {
        self.with_slot(worker_id, |slot| {
            slot.state = WorkerState::Busy {
                task_id: task.id,
                source: task.source.clone(),
                entity_ref: task.entity_ref.clone(),
                priority_class: task.priority_class,
                attempt: task.attempt,
                since: now,
            };
            slot.heartbeat = Some(now);
        });
    }

    pub fn worker_idle(&self, worker_id: usize, now: DateTime<Utc>) {
        self.with_slot(worker_id, |slot| {
            slot.state = WorkerState::Idle;
            slot.heartbeat = Some(now);
        });
    }

    pub fn workers(&self) -> Vec<WorkerSlot> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ---- outcomes ----------------------------------------------------------

    /// Append to the ring buffer and bump the matching total.
    pub fn record(&self, event: TaskEvent) {
        match event.status {
            TaskStatus::Done => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::Failed => {
                self.requeued.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::Abandoned => {
                self.abandoned.fetch_add(1, Ordering::Relaxed);
                let mut abandoned_at = self.abandoned_at.lock().unwrap_or_else(PoisonError::into_inner);
                abandoned_at.push_back(event.at);
                prune_before(&mut abandoned_at, event.at - self.recent_window);
            }
            TaskStatus::Pending => {
                self.released.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::InProgress => {}
        }

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        while recent.len() >= self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    pub fn recent(&self) -> Vec<TaskEvent> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    pub fn totals(&self) -> Totals {
        Totals {
            completed: self.completed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    pub fn abandoned_within_window(&self, now: DateTime<Utc>) -> usize {
        let mut abandoned_at = self.abandoned_at.lock().unwrap_or_else(PoisonError::into_inner);
        prune_before(&mut abandoned_at, now - self.recent_window);
        abandoned_at.len()
    }

    // ---- reconciliation ----------------------------------------------------

    pub fn reconcile_started(&self) {
        self.reconcile
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .in_progress = true;
    }

    pub fn reconcile_succeeded(&self, report: PassReport) {
        let mut view = self.reconcile.write().unwrap_or_else(PoisonError::into_inner);
        view.in_progress = false;
        view.last_success_at = Some(report.finished_at);
        view.last_pass = Some(report);
        view.last_error = None;
    }

    pub fn reconcile_failed(&self, class: ErrorClass, message: impl Into<String>, at: DateTime<Utc>) {
        let mut view = self.reconcile.write().unwrap_or_else(PoisonError::into_inner);
        view.in_progress = false;
        view.last_error = Some(ReconcileFailure {
            class,
            message: message.into(),
            at,
        });
    }

    /// Pass ended without an outcome worth reporting (cancelled).
    pub fn reconcile_interrupted(&self) {
        self.reconcile
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .in_progress = false;
    }

    pub fn reconciliation(&self) -> ReconcileView {
        self.reconcile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ---- views -------------------------------------------------------------

    pub fn snapshot(&self, now: DateTime<Utc>, queue: QueueSnapshot) -> EngineStatus {
        let workers = self.workers();
        let busy = workers.iter().filter(|w| w.is_busy()).count();
        let started_at = *self.started_at.read().unwrap_or_else(PoisonError::into_inner);
        let last_reconciliation = self.reconciliation();

        EngineStatus {
            state: self.state(),
            started_at,
            uptime_secs: started_at.map(|at| (now - at).num_seconds().max(0)),
            workers: WorkerSummary {
                total: workers.len(),
                busy,
                idle: workers.len() - busy,
            },
            queue,
            last_reconciliation_error: last_reconciliation.last_error.as_ref().map(|e| e.class),
            last_reconciliation,
            abandoned_recent: self.abandoned_within_window(now),
            totals: self.totals(),
        }
    }

    pub fn tasks(&self) -> TasksView {
        TasksView {
            in_flight: self.workers().into_iter().filter(WorkerSlot::is_busy).collect(),
            recent: self.recent(),
        }
    }

    /// Alive when STARTING, or RUNNING with at least one worker that either
    /// sent a heartbeat within `timeout` or has been busy for no longer than
    /// `busy_allowance + timeout` (a worker only beats between tasks).
    pub fn liveness(&self, now: DateTime<Utc>, timeout: Duration, busy_allowance: Duration) -> Liveness {
        let state = self.state();
        let reason = match state {
            EngineState::Starting => None,
            EngineState::Running => {
                let fresh = self.workers().iter().any(|w| {
                    let beat = w.heartbeat.is_some_and(|beat| now - beat <= timeout);
                    let working = match &w.state {
                        WorkerState::Busy { since, .. } => busy_allowance
                            .checked_add(&timeout)
                            .is_none_or(|limit| now - *since <= limit),
                        WorkerState::Idle => false,
                    };
                    beat || working
                });
                (!fresh).then(|| format!("no worker heartbeat within {}s", timeout.num_seconds()))
            }
            EngineState::Stopping | EngineState::Stopped => Some(format!("engine is {state:?}")),
        };
        Liveness {
            ok: reason.is_none(),
            state,
            reason,
        }
    }
}

fn prune_before(times: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while times.front().is_some_and(|at| *at < cutoff) {
        times.pop_front();
    }
}
