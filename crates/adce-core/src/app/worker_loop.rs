//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 タスク）
//! 1. `TaskQueue::dequeue(poll_interval)` で task 取得
//! 2. `RateLimiters::acquire(source, permit_wait)`; not granted -> recoverable
//! 3. `SourceAdapter::fetch` under the fetch timeout
//! 4. success -> `Persistence::save_result` -> `TaskQueue::complete`
//! 5. recoverable -> `TaskQueue::requeue(base * 2^attempt)`, permanent -> `TaskQueue::abandon`
//!
//! Two tokens drive shutdown: `stop` (finish the current task, take no more)
//! and `abort` (drop the current task back to PENDING now).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rate_limit::RateLimiters;
use super::registry::SourceRegistry;
use super::status::{StatusBoard, TaskEvent};
use crate::config::ExecutorConfig;
use crate::domain::{Task, TaskError, TaskStatus};
use crate::ports::{Clock, Persistence};
use crate::queue::{QueueError, RequeueOutcome, TaskQueue};

/// How long aborted workers get to hand their task back before the
/// runtime task itself is aborted.
const FORCE_JOIN: Duration = Duration::from_millis(250);

/// Everything a worker needs, shared by all workers.
pub struct Executor {
    queue: Arc<TaskQueue>,
    registry: Arc<SourceRegistry>,
    limiters: Arc<RateLimiters>,
    persistence: Arc<dyn Persistence>,
    board: Arc<StatusBoard>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

/// Result of `WorkerGroup::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker finished within the grace period.
    pub graceful: bool,

    /// Workers that had to be cancelled.
    pub forced: usize,
}

/// Worker group handle.
/// - `request_shutdown()`: stop taking new tasks
/// - `shutdown(grace)`: wait up to `grace`, then force-cancel
pub struct WorkerGroup {
    stop: CancellationToken,
    abort: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<SourceRegistry>,
        limiters: Arc<RateLimiters>,
        persistence: Arc<dyn Persistence>,
        board: Arc<StatusBoard>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            limiters,
            persistence,
            board,
            clock,
            config,
        }
    }

    /// Spawn `config.workers` workers.
    pub fn spawn(self: &Arc<Self>) -> WorkerGroup {
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let n = self.config.workers;
        self.board.reset_workers(n);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let executor = Arc::clone(self);
            let stop = stop.clone();
            let abort = abort.clone();
            joins.push(tokio::spawn(async move {
                executor.worker_loop(worker_id, stop, abort).await;
            }));
        }
        info!(workers = n, "executor started");

        WorkerGroup { stop, abort, joins }
    }

    async fn worker_loop(&self, worker_id: usize, stop: CancellationToken, abort: CancellationToken) {
        self.board.worker_idle(worker_id, self.clock.now());
        loop {
            self.board.heartbeat(worker_id, self.clock.now());

            // dequeue は cancel-safe: task を取り出した後に await はない
            let task = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                task = self.queue.dequeue(self.config.poll_interval()) => task,
            };
            let Some(task) = task else {
                continue;
            };

            self.process(worker_id, task, &abort).await;
            self.board.worker_idle(worker_id, self.clock.now());
        }
        debug!(worker_id, "worker stopped");
    }

    /// Run one task to an outcome. Never returns an error: every failure
    /// ends up as requeue, abandon or release.
    async fn process(&self, worker_id: usize, task: Task, abort: &CancellationToken) {
        self.board.worker_busy(worker_id, &task, self.clock.now());
        debug!(
            worker_id,
            task_id = %task.id,
            source = %task.source,
            entity_ref = %task.entity_ref,
            attempt = task.attempt,
            "task started"
        );

        let granted = tokio::select! {
            biased;
            _ = abort.cancelled() => return self.release(task).await,
            granted = self.limiters.acquire(&task.source, self.config.permit_wait()) => granted,
        };
        if !granted {
            return self
                .fail(task, TaskError::recoverable("rate limit permit not granted"))
                .await;
        }

        let Some(adapter) = self.registry.get(&task.source) else {
            let reason = format!("no adapter registered for source '{}'", task.source);
            return self.fail(task, TaskError::permanent(reason)).await;
        };

        let fetch_timeout = self.config.fetch_timeout();
        let fetched = tokio::select! {
            biased;
            _ = abort.cancelled() => return self.release(task).await,
            fetched = tokio::time::timeout(fetch_timeout, adapter.fetch(&task, abort.child_token())) => fetched,
        };
        let output = match fetched {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.fail(task, e).await,
            Err(_) => {
                let reason = format!("fetch timed out after {}s", fetch_timeout.as_secs());
                return self.fail(task, TaskError::recoverable(reason)).await;
            }
        };

        if let Err(e) = self.persistence.save_result(&task, &output.records).await {
            let reason = format!("saving result failed: {e}");
            return self.fail(task, TaskError::recoverable(reason)).await;
        }

        let event = TaskEvent::new(&task, TaskStatus::Done, self.clock.now()).with_detail(format!(
            "{} records, {} gaps closed",
            output.records.len(),
            output.gaps_closed
        ));
        match self.queue.complete(task.clone()).await {
            // terminal record failure is logged by the queue; the task is done either way
            Ok(()) | Err(QueueError::Collaborator(_)) => {
                info!(
                    task_id = %task.id,
                    source = %task.source,
                    entity_ref = %task.entity_ref,
                    records = output.records.len(),
                    "task completed"
                );
                self.board.record(event);
            }
            Err(e) => error!(task_id = %task.id, error = %e, "complete failed"),
        }
    }

    async fn fail(&self, task: Task, err: TaskError) {
        match err {
            TaskError::Recoverable(reason) => {
                let backoff = self.queue.retry_policy().next_delay(task.attempt);
                match self.queue.requeue(task.clone(), backoff, &reason).await {
                    Ok(RequeueOutcome::Requeued { attempt, visible_at }) => {
                        warn!(
                            task_id = %task.id,
                            source = %task.source,
                            entity_ref = %task.entity_ref,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            reason = %reason,
                            "task failed, requeued"
                        );
                        let mut event = TaskEvent::new(&task, TaskStatus::Failed, self.clock.now())
                            .with_detail(format!("{reason}; retry at {visible_at}"));
                        event.attempt = attempt;
                        self.board.record(event);
                    }
                    Ok(RequeueOutcome::Abandoned { attempt, .. }) => {
                        let mut event =
                            TaskEvent::new(&task, TaskStatus::Abandoned, self.clock.now())
                                .with_detail(reason);
                        event.attempt = attempt;
                        self.board.record(event);
                    }
                    Err(e) => error!(task_id = %task.id, error = %e, "requeue failed"),
                }
            }
            TaskError::Permanent(reason) => {
                warn!(
                    task_id = %task.id,
                    source = %task.source,
                    entity_ref = %task.entity_ref,
                    reason = %reason,
                    "task failed permanently, abandoned"
                );
                match self.queue.abandon(task.clone(), &reason).await {
                    Ok(()) | Err(QueueError::Collaborator(_)) => {
                        self.board.record(
                            TaskEvent::new(&task, TaskStatus::Abandoned, self.clock.now())
                                .with_detail(reason),
                        );
                    }
                    Err(e) => error!(task_id = %task.id, error = %e, "abandon failed"),
                }
            }
        }
    }

    async fn release(&self, task: Task) {
        match self.queue.release(task.clone()).await {
            Ok(()) => {
                info!(task_id = %task.id, "in-flight task released on shutdown");
                self.board.record(
                    TaskEvent::new(&task, TaskStatus::Pending, self.clock.now())
                        .with_detail("released on shutdown"),
                );
            }
            Err(e) => error!(task_id = %task.id, error = %e, "release failed"),
        }
    }
}

impl WorkerGroup {
    /// Stop taking new tasks. In-flight tasks keep running.
    pub fn request_shutdown(&self) {
        self.stop.cancel();
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Ask workers to finish, wait up to `grace`, then cancel whatever is
    /// still running (its task goes back to PENDING).
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        self.request_shutdown();
        let deadline = Instant::now() + grace;

        let mut lagging = Vec::new();
        for mut join in self.joins {
            if tokio::time::timeout_at(deadline, &mut join).await.is_err() {
                lagging.push(join);
            }
        }
        if lagging.is_empty() {
            return ShutdownReport {
                graceful: true,
                forced: 0,
            };
        }

        warn!(workers = lagging.len(), "grace period elapsed, cancelling in-flight tasks");
        self.abort.cancel();
        let force_deadline = Instant::now() + FORCE_JOIN;
        let forced = lagging.len();
        for mut join in lagging {
            if tokio::time::timeout_at(force_deadline, &mut join).await.is_err() {
                join.abort();
                let _ = join.await;
            }
        }
        ShutdownReport {
            graceful: false,
            forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::domain::{EntityRef, PriorityClass, SourceId};
    use crate::impls::InMemoryPersistence;
    use crate::ports::{FetchOutput, FixedClock, IdGenerator, SourceAdapter, UlidGenerator};
    use crate::queue::RetryPolicy;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    /// Behaviour is picked from the entity ref prefix.
    struct ScriptedAdapter(SourceId);

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source(&self) -> &SourceId {
            &self.0
        }

        async fn fetch(&self, task: &Task, cancel: CancellationToken) -> Result<FetchOutput, TaskError> {
            let entity = task.entity_ref.as_str();
            if entity.starts_with("retry") {
                Err(TaskError::recoverable("upstream 503"))
            } else if entity.starts_with("bad") {
                Err(TaskError::permanent("unknown entity"))
            } else if entity.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(FetchOutput::new(vec![json!({"entity": entity})]))
            } else if entity.starts_with("hang") {
                cancel.cancelled().await;
                Err(TaskError::recoverable("cancelled"))
            } else {
                Ok(FetchOutput::new(vec![json!({"entity": entity})]))
            }
        }
    }

    struct Fixture {
        queue: Arc<TaskQueue>,
        board: Arc<StatusBoard>,
        persistence: Arc<InMemoryPersistence>,
        clock: Arc<FixedClock>,
        executor: Arc<Executor>,
    }

    fn fixture(limiters: RateLimiters) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let persistence = Arc::new(InMemoryPersistence::new());
        let queue = Arc::new(TaskQueue::new(
            RetryPolicy::from_config(&RetryConfig::default()),
            clock.clone(),
            persistence.clone(),
        ));
        let board = Arc::new(StatusBoard::new(50, chrono::Duration::hours(1)));
        let mut registry = SourceRegistry::new();
        registry
            .register(Arc::new(ScriptedAdapter(SourceId::new("espn"))))
            .unwrap();

        let config = ExecutorConfig {
            workers: 2,
            poll_interval_ms: 20,
            permit_wait_ms: 20,
            fetch_timeout_secs: 5,
            grace_timeout_secs: 1,
        };
        let executor = Arc::new(Executor::new(
            queue.clone(),
            Arc::new(registry),
            Arc::new(limiters),
            persistence.clone(),
            board.clone(),
            clock.clone(),
            config,
        ));
        Fixture {
            queue,
            board,
            persistence,
            clock,
            executor,
        }
    }

    impl Fixture {
        async fn enqueue(&self, source: &str, entity: &str) {
            let ids = UlidGenerator::new(self.clock.clone());
            let task = Task::new(
                ids.generate_task_id(),
                SourceId::new(source),
                EntityRef::new(entity),
                PriorityClass::High,
                self.clock.now(),
            );
            self.queue.enqueue(task).await.unwrap();
        }

        async fn wait_for_events(&self, n: usize) -> Vec<TaskEvent> {
            for _ in 0..200 {
                let recent = self.board.recent();
                if recent.len() >= n {
                    return recent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {n} events, got {:?}", self.board.recent());
        }
    }

    #[tokio::test]
    async fn success_saves_result_and_completes() {
        let f = fixture(RateLimiters::new());
        f.enqueue("espn", "game-1").await;
        let group = f.executor.spawn();

        let events = f.wait_for_events(1).await;
        assert_eq!(events[0].status, TaskStatus::Done);
        assert_eq!(f.persistence.results().len(), 1);
        assert_eq!(f.persistence.terminal_records()[0].status, TaskStatus::Done);

        let report = group.shutdown(Duration::from_secs(1)).await;
        assert!(report.graceful);
    }

    #[tokio::test]
    async fn recoverable_error_requeues_with_backoff() {
        let f = fixture(RateLimiters::new());
        f.enqueue("espn", "retry-1").await;
        let group = f.executor.spawn();

        let events = f.wait_for_events(1).await;
        assert_eq!(events[0].status, TaskStatus::Failed);
        assert_eq!(events[0].attempt, 1);

        let snap = f.queue.snapshot();
        assert_eq!(snap.delayed, 1);
        assert_eq!(snap.in_flight, 0);
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn permanent_error_abandons() {
        let f = fixture(RateLimiters::new());
        f.enqueue("espn", "bad-1").await;
        let group = f.executor.spawn();

        let events = f.wait_for_events(1).await;
        assert_eq!(events[0].status, TaskStatus::Abandoned);
        assert_eq!(f.queue.snapshot().total_pending, 0);
        assert_eq!(f.persistence.terminal_records()[0].reason.as_deref(), Some("unknown entity"));
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_source_is_permanent() {
        let f = fixture(RateLimiters::new());
        f.enqueue("nba", "game-1").await;
        let group = f.executor.spawn();

        let events = f.wait_for_events(1).await;
        assert_eq!(events[0].status, TaskStatus::Abandoned);
        assert!(events[0].detail.as_deref().unwrap().contains("no adapter"));
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn save_failure_is_recoverable() {
        let f = fixture(RateLimiters::new());
        f.persistence.fail_results(true);
        f.enqueue("espn", "game-1").await;
        let group = f.executor.spawn();

        let events = f.wait_for_events(1).await;
        assert_eq!(events[0].status, TaskStatus::Failed);
        assert!(f.persistence.terminal_records().is_empty());
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn permit_not_granted_is_recoverable() {
        let mut limiters = RateLimiters::new();
        limiters.set(SourceId::new("espn"), 0.01, 1);
        let f = fixture(limiters);
        f.enqueue("espn", "game-1").await;
        f.enqueue("espn", "game-2").await;
        let group = f.executor.spawn();

        let events = f.wait_for_events(2).await;
        let statuses: Vec<TaskStatus> = events.iter().map(|e| e.status).collect();
        assert!(statuses.contains(&TaskStatus::Done));
        assert!(statuses.contains(&TaskStatus::Failed));
        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn graceful_shutdown_lets_the_current_task_finish() {
        let f = fixture(RateLimiters::new());
        f.enqueue("espn", "slow-1").await;
        let group = f.executor.spawn();

        for _ in 0..100 {
            if f.queue.snapshot().in_flight == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = group.shutdown(Duration::from_secs(2)).await;

        assert!(report.graceful);
        assert_eq!(f.board.recent()[0].status, TaskStatus::Done);
        assert_eq!(f.queue.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn forced_shutdown_releases_the_task() {
        let f = fixture(RateLimiters::new());
        f.enqueue("espn", "hang-1").await;
        let group = f.executor.spawn();

        for _ in 0..100 {
            if f.queue.snapshot().in_flight == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let started = Instant::now();
        let report = group.shutdown(Duration::from_millis(100)).await;

        assert!(!report.graceful);
        assert_eq!(report.forced, 1);
        assert!(started.elapsed() < Duration::from_millis(100) + FORCE_JOIN + Duration::from_millis(100));

        let snap = f.queue.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.total_pending, 1);
        assert_eq!(f.board.recent()[0].status, TaskStatus::Pending);
    }
}
