//! ReconcilerLoop - expected と actual の差分からタスクを生成
//!
//! One pass:
//! 1. list expected and actual inventory over the trailing window (concurrently)
//! 2. `plan_gaps`: missing = expected \ actual, stale = actual older than the threshold
//! 3. enqueue one task per gap
//!
//! If either listing fails nothing is enqueued. Passes never overlap.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::StatusBoard;
use crate::config::{PriorityRules, ReconcileConfig};
use crate::domain::{CollaboratorError, DedupKey, PassId, PriorityClass, Task, TaskId};
use crate::ports::{
    ActualInventory, Clock, ExpectedInventory, IdGenerator, InventoryItem, ReconcileWindow,
};
use crate::queue::{QueueError, TaskQueue};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("a reconciliation pass is already running")]
    AlreadyRunning,

    #[error("reconciliation pass cancelled")]
    Cancelled,

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Metrics of one completed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: PassId,
    pub window: ReconcileWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub expected: usize,
    pub actual: usize,
    pub missing: usize,
    pub stale: usize,
    pub enqueued: usize,
    pub merged: usize,

    /// Gaps left out because their key was abandoned within the cooldown.
    #[serde(default)]
    pub suppressed: usize,
}

impl PassReport {
    /// Items scanned (expected + actual).
    pub fn items_scanned(&self) -> usize {
        self.expected + self.actual
    }

    pub fn gaps_found(&self) -> usize {
        self.missing + self.stale
    }

    #[cfg(test)]
    pub(crate) fn empty(at: DateTime<Utc>) -> Self {
        Self {
            pass_id: PassId::from_ulid(ulid::Ulid::nil()),
            window: ReconcileWindow { start: at, end: at },
            started_at: at,
            finished_at: at,
            duration_ms: 0,
            expected: 0,
            actual: 0,
            missing: 0,
            stale: 0,
            enqueued: 0,
            merged: 0,
            suppressed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    Missing,
    Stale,
}

/// One gap, already classified.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub item: InventoryItem,
    pub kind: GapKind,
    pub class: PriorityClass,

    /// Tie-break bonus inside the class band (gap age in hours, capped).
    pub bonus: f64,
}

impl Gap {
    pub fn into_task(self, id: TaskId, now: DateTime<Utc>) -> Task {
        let mut task = Task::new(id, self.item.source, self.item.entity_ref, self.class, now)
            .with_bonus(self.bonus);
        task.event_at = self.item.event_at;
        task
    }
}

/// Priority class from the event date alone.
pub fn classify(event_at: Option<DateTime<Utc>>, now: DateTime<Utc>, rules: &PriorityRules) -> PriorityClass {
    let Some(event_at) = event_at else {
        return PriorityClass::Low;
    };
    let age = now - event_at;
    if age <= hours(rules.critical_within_hours) {
        PriorityClass::Critical
    } else if age <= hours(rules.high_within_hours) {
        PriorityClass::High
    } else if age <= hours(rules.medium_within_hours) {
        PriorityClass::Medium
    } else {
        PriorityClass::Low
    }
}

fn hours(h: u64) -> Duration {
    Duration::hours(h.min(i64::MAX as u64 / 3600) as i64)
}

fn age_bonus(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    since.map_or(0.0, |at| ((now - at).num_hours().max(0) as f64).min(999.0))
}

/// Diff expected against actual.
///
/// Missing items come first, keyed by `(source, entity_ref)`; stale items
/// are demoted one class below what their event date alone would give.
pub fn plan_gaps(
    expected: &[InventoryItem],
    actual: &[InventoryItem],
    now: DateTime<Utc>,
    staleness: Duration,
    rules: &PriorityRules,
) -> Vec<Gap> {
    let present: HashSet<DedupKey> = actual.iter().map(InventoryItem::key).collect();
    let mut seen: HashSet<DedupKey> = HashSet::new();
    let mut gaps = Vec::new();

    for item in expected {
        let key = item.key();
        if present.contains(&key) || !seen.insert(key) {
            continue;
        }
        gaps.push(Gap {
            class: classify(item.event_at, now, rules),
            bonus: age_bonus(item.event_at, now),
            kind: GapKind::Missing,
            item: item.clone(),
        });
    }

    let cutoff = now - staleness;
    for item in actual {
        let Some(last_updated) = item.last_updated else {
            continue;
        };
        if last_updated >= cutoff || !seen.insert(item.key()) {
            continue;
        }
        gaps.push(Gap {
            class: classify(item.event_at, now, rules).demote(),
            bonus: age_bonus(Some(last_updated), now),
            kind: GapKind::Stale,
            item: item.clone(),
        });
    }

    gaps
}

/// Single-flight guard; clears the flag on drop.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    expected: Arc<dyn ExpectedInventory>,
    actual: Arc<dyn ActualInventory>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    board: Arc<StatusBoard>,
    config: ReconcileConfig,
    rules: PriorityRules,
    running: AtomicBool,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        expected: Arc<dyn ExpectedInventory>,
        actual: Arc<dyn ActualInventory>,
        queue: Arc<TaskQueue>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        board: Arc<StatusBoard>,
        config: ReconcileConfig,
        rules: PriorityRules,
    ) -> Self {
        Self {
            expected,
            actual,
            queue,
            clock,
            ids,
            board,
            config,
            rules,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one pass now. `cancel` aborts it without enqueueing anything.
    pub async fn reconcile_once(&self, cancel: &CancellationToken) -> Result<PassReport, ReconcileError> {
        let _guard = PassGuard::acquire(&self.running).ok_or(ReconcileError::AlreadyRunning)?;

        let pass_id = self.ids.generate_pass_id();
        let started_at = self.clock.now();
        let timer = Instant::now();
        let window = ReconcileWindow::trailing(started_at, self.config.lookback());
        self.board.reconcile_started();
        debug!(pass_id = %pass_id, start = %window.start, end = %window.end, "reconciliation pass started");

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.board.reconcile_interrupted();
                return Err(ReconcileError::Cancelled);
            }
            listed = async {
                tokio::try_join!(
                    self.expected.list_expected(&window),
                    self.actual.list_actual(&window),
                )
            } => listed,
        };

        let (expected, actual) = match listed {
            Ok(listed) => listed,
            Err(e) => {
                warn!(pass_id = %pass_id, error = %e, "reconciliation pass failed, nothing enqueued");
                self.board.reconcile_failed(e.class(), e.to_string(), self.clock.now());
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let mut gaps = plan_gaps(&expected, &actual, now, self.config.staleness(), &self.rules);
        let missing = gaps.iter().filter(|g| g.kind == GapKind::Missing).count();
        let stale = gaps.len() - missing;

        // a zero cooldown forgets every abandoned key
        let cooldown = self.config.abandoned_cooldown();
        let since = if cooldown > Duration::zero() {
            now.checked_sub_signed(cooldown).unwrap_or(DateTime::<Utc>::MIN_UTC)
        } else {
            DateTime::<Utc>::MAX_UTC
        };
        let abandoned = self.queue.abandoned_since(since).await;
        gaps.retain(|gap| !abandoned.contains(&gap.item.key()));
        let suppressed = missing + stale - gaps.len();
        if suppressed > 0 {
            debug!(pass_id = %pass_id, suppressed, "recently abandoned gaps skipped");
        }

        let mut enqueued = 0;
        let mut merged = 0;
        for gap in gaps {
            // stop between inserts; what is already queued stays queued
            if cancel.is_cancelled() {
                self.board.reconcile_interrupted();
                return Err(ReconcileError::Cancelled);
            }
            let task = gap.into_task(self.ids.generate_task_id(), now);
            match self.queue.enqueue(task).await {
                Ok(true) => enqueued += 1,
                Ok(false) => merged += 1,
                Err(e) => {
                    self.board.reconcile_failed(e.class(), e.to_string(), self.clock.now());
                    return Err(e.into());
                }
            }
        }

        let report = PassReport {
            pass_id,
            window,
            started_at,
            finished_at: self.clock.now(),
            duration_ms: timer.elapsed().as_millis().min(u64::MAX as u128) as u64,
            expected: expected.len(),
            actual: actual.len(),
            missing,
            stale,
            enqueued,
            merged,
            suppressed,
        };
        info!(
            pass_id = %pass_id,
            scanned = report.items_scanned(),
            missing,
            stale,
            enqueued,
            merged,
            suppressed,
            duration_ms = report.duration_ms,
            "reconciliation pass finished"
        );
        self.board.reconcile_succeeded(report.clone());
        Ok(report)
    }

    /// Timer loop: one pass immediately, then every `interval`, until `stop`.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.config.interval_secs, "reconciler started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile_once(&stop).await {
                Ok(_) => {}
                Err(ReconcileError::AlreadyRunning) => {
                    debug!("previous reconciliation pass still running, tick skipped");
                }
                Err(ReconcileError::Cancelled) => break,
                // Already logged and surfaced on the status board.
                Err(_) => {}
            }
        }
        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::domain::{EntityRef, ErrorClass, SourceId};
    use crate::impls::{InMemoryPersistence, StaticInventory};
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::queue::RetryPolicy;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rstest::rstest;
    use tokio::sync::Notify;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn item(entity: &str, event_age_hours: i64) -> InventoryItem {
        InventoryItem::new(SourceId::new("espn"), EntityRef::new(entity))
            .with_event_at(now() - Duration::hours(event_age_hours))
    }

    #[rstest]
    #[case(Some(2), PriorityClass::Critical)]
    #[case(Some(24), PriorityClass::Critical)]
    #[case(Some(48), PriorityClass::High)]
    #[case(Some(100), PriorityClass::Medium)]
    #[case(Some(24 * 30), PriorityClass::Low)]
    #[case(None, PriorityClass::Low)]
    fn classify_uses_event_age(#[case] age_hours: Option<i64>, #[case] expected: PriorityClass) {
        let event_at = age_hours.map(|h| now() - Duration::hours(h));
        assert_eq!(classify(event_at, now(), &PriorityRules::default()), expected);
    }

    #[test]
    fn plan_finds_missing_and_stale() {
        let expected = vec![item("a", 2), item("b", 48), item("c", 100)];
        let actual = vec![
            item("b", 48).with_last_updated(now() - Duration::hours(1)),
            item("c", 100).with_last_updated(now() - Duration::hours(30)),
        ];

        let gaps = plan_gaps(&expected, &actual, now(), Duration::hours(24), &PriorityRules::default());

        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].item.entity_ref.as_str(), "a");
        assert_eq!(gaps[0].kind, GapKind::Missing);
        assert_eq!(gaps[0].class, PriorityClass::Critical);
        assert_eq!(gaps[0].bonus, 2.0);

        assert_eq!(gaps[1].item.entity_ref.as_str(), "c");
        assert_eq!(gaps[1].kind, GapKind::Stale);
        assert_eq!(gaps[1].class, PriorityClass::Low);
        assert_eq!(gaps[1].bonus, 30.0);
    }

    #[test]
    fn duplicate_expected_items_yield_one_gap() {
        let expected = vec![item("a", 2), item("a", 2)];
        let gaps = plan_gaps(&expected, &[], now(), Duration::hours(24), &PriorityRules::default());
        assert_eq!(gaps.len(), 1);
    }

    struct Fixture {
        expected: Arc<StaticInventory>,
        actual: Arc<StaticInventory>,
        queue: Arc<TaskQueue>,
        board: Arc<StatusBoard>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture_with(expected: Arc<dyn ExpectedInventory>, actual: Arc<StaticInventory>) -> (Arc<TaskQueue>, Arc<StatusBoard>, Arc<Reconciler>) {
        fixture_with_config(expected, actual, ReconcileConfig::default())
    }

    fn fixture_with_config(
        expected: Arc<dyn ExpectedInventory>,
        actual: Arc<StaticInventory>,
        config: ReconcileConfig,
    ) -> (Arc<TaskQueue>, Arc<StatusBoard>, Arc<Reconciler>) {
        let clock = Arc::new(FixedClock::new(now()));
        let queue = Arc::new(TaskQueue::new(
            RetryPolicy::from_config(&RetryConfig::default()),
            clock.clone(),
            Arc::new(InMemoryPersistence::new()),
        ));
        let board = Arc::new(StatusBoard::new(10, Duration::hours(1)));
        let reconciler = Arc::new(Reconciler::new(
            expected,
            actual,
            queue.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
            board.clone(),
            config,
            PriorityRules::default(),
        ));
        (queue, board, reconciler)
    }

    fn fixture() -> Fixture {
        let expected = Arc::new(StaticInventory::new(vec![item("a", 2), item("b", 48)]));
        let actual = Arc::new(StaticInventory::default());
        let (queue, board, reconciler) = fixture_with(expected.clone(), actual.clone());
        Fixture {
            expected,
            actual,
            queue,
            board,
            reconciler,
        }
    }

    #[tokio::test]
    async fn pass_enqueues_one_task_per_gap() {
        let f = fixture();
        let report = f.reconciler.reconcile_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.expected, 2);
        assert_eq!(report.gaps_found(), 2);
        assert_eq!(report.enqueued, 2);
        let snap = f.queue.snapshot();
        assert_eq!(snap.depth.critical, 1);
        assert_eq!(snap.depth.high, 1);

        let again = f.reconciler.reconcile_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(again.enqueued, 0);
        assert_eq!(again.merged, 2);
        assert_eq!(f.queue.snapshot().total_pending, 2);
        assert!(f.board.reconciliation().last_pass.is_some());
    }

    #[tokio::test]
    async fn provider_error_leaves_queue_unchanged() {
        let f = fixture();
        f.actual.fail_with("storage offline");

        let err = f.reconciler.reconcile_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Collaborator(_)));
        assert_eq!(f.queue.snapshot().total_pending, 0);

        let view = f.board.reconciliation();
        assert!(!view.in_progress);
        let failure = view.last_error.unwrap();
        assert_eq!(failure.class, ErrorClass::Collaborator);
        assert!(failure.message.contains("storage offline"));
    }

    #[tokio::test]
    async fn expected_error_is_reported_too() {
        let f = fixture();
        f.expected.fail_with("schedule unavailable");
        assert!(f.reconciler.reconcile_once(&CancellationToken::new()).await.is_err());
        assert_eq!(f.queue.snapshot().total_pending, 0);
    }

    #[tokio::test]
    async fn cancelled_pass_enqueues_nothing() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.reconciler.reconcile_once(&cancel).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
        assert_eq!(f.queue.snapshot().total_pending, 0);
        assert!(f.board.reconciliation().last_error.is_none());
    }

    /// Blocks `list_expected` until released.
    struct GatedInventory {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ExpectedInventory for GatedInventory {
        async fn list_expected(&self, _window: &ReconcileWindow) -> Result<Vec<InventoryItem>, CollaboratorError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![item("a", 2)])
        }
    }

    #[tokio::test]
    async fn overlapping_pass_is_refused() {
        let gate = Arc::new(GatedInventory {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (queue, _board, reconciler) = fixture_with(gate.clone(), Arc::new(StaticInventory::default()));

        let first = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile_once(&CancellationToken::new()).await })
        };
        gate.entered.notified().await;
        assert!(reconciler.is_running());

        let second = reconciler.reconcile_once(&CancellationToken::new()).await;
        assert!(matches!(second, Err(ReconcileError::AlreadyRunning)));

        gate.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.enqueued, 1);
        assert!(!reconciler.is_running());
        assert_eq!(queue.snapshot().total_pending, 1);
    }

    #[tokio::test]
    async fn run_loop_does_an_immediate_pass_and_stops() {
        let f = fixture();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(f.reconciler.clone().run(stop.clone()));

        for _ in 0..100 {
            if f.queue.snapshot().total_pending == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.queue.snapshot().total_pending, 2);

        stop.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Abandon whatever task is queued for `entity`.
    async fn abandon_queued(queue: &TaskQueue, entity: &str) {
        loop {
            let task = queue.dequeue(std::time::Duration::ZERO).await.unwrap();
            if task.entity_ref.as_str() == entity {
                queue.abandon(task, "HTTP 404").await.unwrap();
                return;
            }
            queue.complete(task).await.unwrap();
        }
    }

    #[tokio::test]
    async fn abandoned_gap_is_not_recreated_within_cooldown() {
        let expected = Arc::new(StaticInventory::new(vec![item("malformed", 2)]));
        let (queue, _board, reconciler) = fixture_with(expected, Arc::new(StaticInventory::default()));

        let first = reconciler.reconcile_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.enqueued, 1);
        abandon_queued(&queue, "malformed").await;

        for _ in 0..3 {
            let report = reconciler.reconcile_once(&CancellationToken::new()).await.unwrap();
            assert_eq!(report.missing, 1);
            assert_eq!(report.suppressed, 1);
            assert_eq!(report.enqueued, 0);
        }
        assert_eq!(queue.snapshot().total_pending, 0);
    }

    #[tokio::test]
    async fn zero_cooldown_recreates_abandoned_gaps() {
        let expected = Arc::new(StaticInventory::new(vec![item("malformed", 2)]));
        let config = ReconcileConfig {
            abandoned_cooldown_secs: 0,
            ..ReconcileConfig::default()
        };
        let (queue, _board, reconciler) =
            fixture_with_config(expected, Arc::new(StaticInventory::default()), config);

        reconciler.reconcile_once(&CancellationToken::new()).await.unwrap();
        abandon_queued(&queue, "malformed").await;

        let report = reconciler.reconcile_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.suppressed, 0);
        assert_eq!(report.enqueued, 1);
        assert!(queue.abandoned_since(DateTime::<Utc>::MIN_UTC).await.is_empty());
    }

    /// Cancels the pass token from inside the listing call.
    struct CancellingInventory {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ExpectedInventory for CancellingInventory {
        async fn list_expected(&self, _window: &ReconcileWindow) -> Result<Vec<InventoryItem>, CollaboratorError> {
            self.cancel.cancel();
            Ok(vec![item("a", 2), item("b", 48)])
        }
    }

    #[tokio::test]
    async fn cancellation_after_listing_stops_before_enqueueing() {
        let cancel = CancellationToken::new();
        let expected = Arc::new(CancellingInventory {
            cancel: cancel.clone(),
        });
        let (queue, board, reconciler) = fixture_with(expected, Arc::new(StaticInventory::default()));

        let err = reconciler.reconcile_once(&cancel).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
        assert_eq!(queue.snapshot().total_pending, 0);
        assert!(board.reconciliation().last_error.is_none());
    }
}
