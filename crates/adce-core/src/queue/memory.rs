//! In-memory task queue.
//!
//! - `pending`: every PENDING task (ready or delayed), keyed by id
//! - `ready`: visible PENDING tasks in dequeue order
//! - `scheduled`: min-heap of delayed tasks keyed by `visible_at`
//! - `index`: one active task per `(source, entity_ref)`
//! - `in_flight`: recovery copies of IN_PROGRESS tasks
//! - `abandoned`: when each key was last abandoned (pruned by `abandoned_since`)
//!
//! All of it sits behind one `tokio::sync::Mutex`. Gauges are republished
//! before the lock is released so `snapshot()` never has to take it.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::snapshot::{QueueGauges, QueueSnapshot};
use super::RetryPolicy;
use crate::domain::{
    CollaboratorError, DedupKey, ErrorClass, PriorityClass, Task, TaskId, TaskStatus,
};
use crate::ports::{Clock, Persistence};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {id} cannot be enqueued with status {status:?}")]
    NotPending { id: TaskId, status: TaskStatus },

    #[error("task {0} is not in flight")]
    NotInFlight(TaskId),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl QueueError {
    pub fn class(&self) -> ErrorClass {
        match self {
            QueueError::Collaborator(e) => e.class(),
            QueueError::NotPending { .. } | QueueError::NotInFlight(_) => ErrorClass::Permanent,
        }
    }
}

/// What `requeue` did with a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// Back to PENDING, hidden until `visible_at`.
    Requeued {
        attempt: u32,
        visible_at: DateTime<Utc>,
    },

    /// Attempt budget exhausted. `persisted` is false when the terminal
    /// record could not be written (already logged).
    Abandoned { attempt: u32, persisted: bool },
}

/// Dequeue order key. `Ord` puts the task to run next first.
#[derive(Debug, Clone, Copy)]
struct ReadyKey {
    class: PriorityClass,
    score: f64,
    created_at: DateTime<Utc>,
    id: TaskId,
}

impl ReadyKey {
    fn of(task: &Task) -> Self {
        Self {
            class: task.priority_class,
            score: task.priority_score,
            created_at: task.created_at,
            id: task.id,
        }
    }
}

impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyKey {}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .class
            .cmp(&self.class)
            .then_with(|| other.score.total_cmp(&self.score))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Scheduled (backoff) entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    visible_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Debug)]
struct InFlight {
    task: Task,

    /// Higher priority seen by a duplicate enqueue while running.
    bump: Option<(PriorityClass, f64)>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<TaskId, Task>,
    ready: BTreeSet<ReadyKey>,
    scheduled: BinaryHeap<ScheduledTask>,
    index: HashMap<DedupKey, TaskId>,
    in_flight: HashMap<TaskId, InFlight>,
    abandoned: HashMap<DedupKey, DateTime<Utc>>,
    by_age: BTreeSet<(DateTime<Utc>, TaskId)>,
    depth: [usize; 4],
}

impl QueueState {
    /// Add a PENDING task; ready or scheduled depending on `visible_at`.
    fn insert_pending(&mut self, task: Task, now: DateTime<Utc>) {
        self.index.insert(task.dedup_key(), task.id);
        self.by_age.insert((task.created_at, task.id));
        self.depth[task.priority_class.index()] += 1;

        if task.is_visible(now) {
            self.ready.insert(ReadyKey::of(&task));
        } else {
            self.scheduled.push(ScheduledTask {
                visible_at: task.visible_at,
                task_id: task.id,
            });
        }
        self.pending.insert(task.id, task);
    }

    /// Move delayed tasks whose time has come into the ready set.
    fn promote_scheduled_tasks(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.visible_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(task) = self.pending.get(&entry.task_id)
                && task.visible_at == entry.visible_at
            {
                self.ready.insert(ReadyKey::of(task));
            }
        }
    }

    fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled.peek().map(|entry| entry.visible_at)
    }

    /// Remove the best ready task and hand it out as IN_PROGRESS.
    fn take_next(&mut self, now: DateTime<Utc>) -> Option<Task> {
        while let Some(key) = self.ready.pop_first() {
            let Some(mut task) = self.pending.remove(&key.id) else {
                continue;
            };
            self.by_age.remove(&(task.created_at, task.id));
            self.depth[task.priority_class.index()] -= 1;

            task.mark_in_progress(now);
            self.in_flight.insert(
                task.id,
                InFlight {
                    task: task.clone(),
                    bump: None,
                },
            );
            return Some(task);
        }
        None
    }

    /// Merge a duplicate into the active task with the same key.
    fn merge(&mut self, active_id: TaskId, incoming: &Task) {
        if let Some(existing) = self.pending.get_mut(&active_id) {
            let old_key = ReadyKey::of(existing);
            let old_class = existing.priority_class;
            if existing.absorb_priority(incoming.priority_class, incoming.priority_score) {
                let new_key = ReadyKey::of(existing);
                let new_class = existing.priority_class;
                if self.ready.remove(&old_key) {
                    self.ready.insert(new_key);
                }
                self.depth[old_class.index()] -= 1;
                self.depth[new_class.index()] += 1;
            }
        } else if let Some(running) = self.in_flight.get_mut(&active_id) {
            let offer = (incoming.priority_class, incoming.priority_score);
            match running.bump {
                Some((_, score)) if score >= offer.1 => {}
                _ => running.bump = Some(offer),
            }
        }
    }

    fn take_in_flight(&mut self, id: TaskId) -> Result<InFlight, QueueError> {
        self.in_flight.remove(&id).ok_or(QueueError::NotInFlight(id))
    }

    fn publish(&self, gauges: &QueueGauges) {
        let oldest = self.by_age.first().map(|(created, _)| *created);
        gauges.publish(
            &self.depth,
            self.scheduled.len(),
            self.in_flight.len(),
            oldest,
        );
    }
}

/// Priority-ordered, deduplicating queue of pending fetch tasks.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    gauges: Arc<QueueGauges>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    persistence: Arc<dyn Persistence>,
}

impl TaskQueue {
    pub fn new(
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            gauges: Arc::new(QueueGauges::default()),
            clock,
            retry_policy,
            persistence,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Shared handle for lock-free readers.
    pub fn gauges(&self) -> Arc<QueueGauges> {
        Arc::clone(&self.gauges)
    }

    /// Insert `task`, or merge it into the active task with the same key.
    ///
    /// Returns `Ok(false)` when merged. Merging keeps the higher score and
    /// does not touch `visible_at`.
    pub async fn enqueue(&self, task: Task) -> Result<bool, QueueError> {
        if task.status != TaskStatus::Pending {
            return Err(QueueError::NotPending {
                id: task.id,
                status: task.status,
            });
        }

        {
            let mut state = self.state.lock().await;
            if let Some(active_id) = state.index.get(&task.dedup_key()).copied() {
                state.merge(active_id, &task);
                state.publish(&self.gauges);
                debug!(
                    task_id = %active_id,
                    source = %task.source,
                    entity_ref = %task.entity_ref,
                    "duplicate enqueue merged"
                );
                return Ok(false);
            }

            let now = self.clock.now();
            debug!(
                task_id = %task.id,
                source = %task.source,
                entity_ref = %task.entity_ref,
                class = %task.priority_class,
                "task enqueued"
            );
            state.insert_pending(task, now);
            state.publish(&self.gauges);
        }

        self.notify.notify_one();
        Ok(true)
    }

    /// Wait up to `max_wait` for the highest-priority visible task.
    ///
    /// The returned task is already IN_PROGRESS; the caller owns it until
    /// it hands it back through `complete`, `abandon`, `requeue` or `release`.
    pub async fn dequeue(&self, max_wait: Duration) -> Option<Task> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();

            let next_visible = {
                let mut state = self.state.lock().await;
                let now = self.clock.now();
                state.promote_scheduled_tasks(now);

                if let Some(task) = state.take_next(now) {
                    state.publish(&self.gauges);
                    let more_ready = !state.ready.is_empty();
                    drop(state);
                    if more_ready {
                        self.notify.notify_one();
                    }
                    return Some(task);
                }
                state.publish(&self.gauges);
                state.next_visible_at().map(|at| {
                    (at - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
            };

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake = next_visible.map_or(deadline, |delay| deadline.min(now + delay));

            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(wake) => {},
            }
        }
    }

    /// Failed attempt: back to PENDING after `backoff`, or ABANDONED when
    /// the attempt budget is used up.
    pub async fn requeue(
        &self,
        mut task: Task,
        backoff: Duration,
        reason: &str,
    ) -> Result<RequeueOutcome, QueueError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let in_flight = state.take_in_flight(task.id)?;
            let now = self.clock.now();
            let next_attempt = task.attempt.saturating_add(1);

            if self.retry_policy.is_exhausted(next_attempt) {
                task.attempt = next_attempt;
                task.mark_abandoned(reason);
                state.index.remove(&task.dedup_key());
                state.abandoned.insert(task.dedup_key(), now);
                state.publish(&self.gauges);
                None
            } else {
                let visible_at = chrono::Duration::from_std(backoff)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let decayed = self
                    .retry_policy
                    .decay_score(task.priority_class, task.priority_score);

                task.mark_failed(reason);
                task.schedule_retry(decayed, visible_at);
                if let Some((class, score)) = in_flight.bump {
                    task.absorb_priority(class, score);
                }

                let outcome = RequeueOutcome::Requeued {
                    attempt: task.attempt,
                    visible_at,
                };
                state.insert_pending(task.clone(), now);
                state.publish(&self.gauges);
                Some(outcome)
            }
        };

        match outcome {
            Some(outcome) => {
                debug!(task_id = %task.id, attempt = task.attempt, "task requeued");
                self.notify.notify_one();
                Ok(outcome)
            }
            None => {
                warn!(
                    task_id = %task.id,
                    source = %task.source,
                    entity_ref = %task.entity_ref,
                    attempt = task.attempt,
                    reason,
                    "attempts exhausted, task abandoned"
                );
                let persisted = self.persist_terminal(&task, Some(reason)).await.is_ok();
                Ok(RequeueOutcome::Abandoned {
                    attempt: task.attempt,
                    persisted,
                })
            }
        }
    }

    /// Successful task leaves the queue for good.
    pub async fn complete(&self, mut task: Task) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.take_in_flight(task.id)?;
            let key = task.dedup_key();
            state.index.remove(&key);
            state.abandoned.remove(&key);
            state.publish(&self.gauges);
        }
        task.mark_done();
        self.persist_terminal(&task, None).await
    }

    /// Permanent failure; no retry.
    pub async fn abandon(&self, mut task: Task, reason: &str) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.take_in_flight(task.id)?;
            let key = task.dedup_key();
            state.index.remove(&key);
            state.abandoned.insert(key, self.clock.now());
            state.publish(&self.gauges);
        }
        task.mark_abandoned(reason);
        self.persist_terminal(&task, Some(reason)).await
    }

    /// Return an IN_PROGRESS task to PENDING without counting an attempt.
    pub async fn release(&self, mut task: Task) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let in_flight = state.take_in_flight(task.id)?;
            let now = self.clock.now();
            task.release(now);
            if let Some((class, score)) = in_flight.bump {
                task.absorb_priority(class, score);
            }
            state.insert_pending(task, now);
            state.publish(&self.gauges);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Release every task still marked IN_PROGRESS. Returns how many.
    pub async fn recover_in_flight(&self) -> usize {
        let released = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let drained: Vec<InFlight> = state.in_flight.drain().map(|(_, f)| f).collect();
            let count = drained.len();
            for InFlight { mut task, bump } in drained {
                task.release(now);
                if let Some((class, score)) = bump {
                    task.absorb_priority(class, score);
                }
                state.insert_pending(task, now);
            }
            state.publish(&self.gauges);
            count
        };

        if released > 0 {
            warn!(released, "in-flight tasks returned to pending");
            self.notify.notify_waiters();
        }
        released
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.gauges.snapshot(self.clock.now())
    }

    /// Active task for `key`, PENDING or IN_PROGRESS.
    pub async fn find(&self, key: &DedupKey) -> Option<Task> {
        let state = self.state.lock().await;
        let id = state.index.get(key)?;
        state
            .pending
            .get(id)
            .cloned()
            .or_else(|| state.in_flight.get(id).map(|f| f.task.clone()))
    }

    /// Keys abandoned at or after `since`. Older entries are forgotten.
    pub async fn abandoned_since(&self, since: DateTime<Utc>) -> HashSet<DedupKey> {
        let mut state = self.state.lock().await;
        state.abandoned.retain(|_, at| *at >= since);
        state.abandoned.keys().cloned().collect()
    }

    /// Copies of every IN_PROGRESS task.
    pub async fn in_flight(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state.in_flight.values().map(|f| f.task.clone()).collect()
    }

    async fn persist_terminal(&self, task: &Task, reason: Option<&str>) -> Result<(), QueueError> {
        self.persistence
            .save_terminal(task, task.status, reason)
            .await
            .map_err(|e| {
                error!(
                    task_id = %task.id,
                    status = ?task.status,
                    error = %e,
                    "failed to persist terminal task record"
                );
                QueueError::Collaborator(e)
            })
    }
}
