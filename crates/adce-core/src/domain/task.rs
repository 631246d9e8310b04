//! Fetch task model.
//!
//! A `Task` is one unit of gap-closing work: "fetch `entity_ref` from `source`".
//! State transitions are done through methods so the invariants
//! (`attempt` only grows, score stays inside its class band) live in one place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Width of the score band owned by one priority class.
pub const CLASS_BAND: f64 = 999.0;

/// Name of a data source; selects the `SourceAdapter` and the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque key of the data unit to fetch (game id, date, ...).
/// Only the source adapter interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRef(String);

impl EntityRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Deduplication key: at most one active task per key.
pub type DedupKey = (SourceId, EntityRef);

/// Coarse urgency bucket. Declaration order is the sort order (`Critical` is max).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityClass {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityClass {
    /// Highest first.
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::Critical,
        PriorityClass::High,
        PriorityClass::Medium,
        PriorityClass::Low,
    ];

    /// Lowest score a task of this class may carry.
    pub fn floor(self) -> f64 {
        match self {
            PriorityClass::Low => 1000.0,
            PriorityClass::Medium => 2000.0,
            PriorityClass::High => 3000.0,
            PriorityClass::Critical => 4000.0,
        }
    }

    /// Highest score a task of this class may carry.
    pub fn ceiling(self) -> f64 {
        self.floor() + CLASS_BAND
    }

    /// Clamp `score` into this class's band.
    pub fn clamp(self, score: f64) -> f64 {
        if score.is_nan() {
            return self.floor();
        }
        score.clamp(self.floor(), self.ceiling())
    }

    /// One class lower (`Low` stays `Low`).
    pub fn demote(self) -> Self {
        match self {
            PriorityClass::Critical => PriorityClass::High,
            PriorityClass::High => PriorityClass::Medium,
            PriorityClass::Medium | PriorityClass::Low => PriorityClass::Low,
        }
    }

    /// Slot in per-class arrays (0 = Low .. 3 = Critical).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::Low => "LOW",
            PriorityClass::Medium => "MEDIUM",
            PriorityClass::High => "HIGH",
            PriorityClass::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle.
///
/// - Pending -> InProgress -> Done
/// - Pending -> InProgress -> Failed -> Pending (requeue with backoff)
/// - Pending -> InProgress -> Abandoned (permanent error or attempts exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Abandoned)
    }

    /// Counts against the one-active-task-per-key rule.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub source: SourceId,
    pub entity_ref: EntityRef,
    pub priority_class: PriorityClass,
    pub priority_score: f64,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Not dequeueable before this instant (backoff).
    pub visible_at: DateTime<Utc>,
    pub status: TaskStatus,

    /// Date the entity refers to, when known (game day etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Task {
    /// New pending task, score at the class floor, visible immediately.
    pub fn new(
        id: TaskId,
        source: SourceId,
        entity_ref: EntityRef,
        priority_class: PriorityClass,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source,
            entity_ref,
            priority_class,
            priority_score: priority_class.floor(),
            attempt: 0,
            created_at: now,
            last_attempt_at: None,
            visible_at: now,
            status: TaskStatus::Pending,
            event_at: None,
            last_error: None,
        }
    }

    /// Add a tie-break bonus on top of the class floor (clamped to the band).
    pub fn with_bonus(mut self, bonus: f64) -> Self {
        self.priority_score = self.priority_class.clamp(self.priority_class.floor() + bonus);
        self
    }

    pub fn with_event_at(mut self, event_at: DateTime<Utc>) -> Self {
        self.event_at = Some(event_at);
        self
    }

    pub fn dedup_key(&self) -> DedupKey {
        (self.source.clone(), self.entity_ref.clone())
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }

    /// Pending -> InProgress.
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.last_attempt_at = Some(now);
    }

    /// Failed attempt bookkeeping; the queue decides whether it comes back.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(reason.into());
    }

    /// Back to pending after a failure: one more attempt on the books,
    /// score decayed (never under the floor), hidden until `visible_at`.
    pub fn schedule_retry(&mut self, decayed_score: f64, visible_at: DateTime<Utc>) {
        self.attempt = self.attempt.saturating_add(1);
        self.priority_score = self.priority_class.clamp(decayed_score);
        self.visible_at = visible_at;
        self.status = TaskStatus::Pending;
    }

    /// Back to pending without counting an attempt (forced cancellation).
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.visible_at = now;
    }

    /// Adopt a higher (class, score) pair coming from a duplicate enqueue.
    /// Returns true when something changed.
    pub fn absorb_priority(&mut self, class: PriorityClass, score: f64) -> bool {
        if score > self.priority_score {
            self.priority_class = class;
            self.priority_score = class.clamp(score);
            true
        } else {
            false
        }
    }

    pub fn mark_done(&mut self) {
        self.status = TaskStatus::Done;
    }

    pub fn mark_abandoned(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Abandoned;
        self.last_error = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn task(class: PriorityClass) -> Task {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            SourceId::new("espn"),
            EntityRef::new("game:401584"),
            class,
            now,
        )
    }

    #[rstest]
    #[case(PriorityClass::Low, PriorityClass::Medium)]
    #[case(PriorityClass::Medium, PriorityClass::High)]
    #[case(PriorityClass::High, PriorityClass::Critical)]
    fn class_order_puts_critical_on_top(#[case] lower: PriorityClass, #[case] higher: PriorityClass) {
        assert!(higher > lower);
        assert!(higher.floor() > lower.ceiling());
    }

    #[rstest]
    #[case(PriorityClass::Critical, PriorityClass::High)]
    #[case(PriorityClass::High, PriorityClass::Medium)]
    #[case(PriorityClass::Medium, PriorityClass::Low)]
    #[case(PriorityClass::Low, PriorityClass::Low)]
    fn demote_moves_one_class_down(#[case] from: PriorityClass, #[case] to: PriorityClass) {
        assert_eq!(from.demote(), to);
    }

    #[test]
    fn bonus_is_clamped_to_band() {
        let t = task(PriorityClass::High).with_bonus(5_000.0);
        assert_eq!(t.priority_score, PriorityClass::High.ceiling());

        let t = task(PriorityClass::High).with_bonus(-10.0);
        assert_eq!(t.priority_score, PriorityClass::High.floor());
    }

    #[test]
    fn retry_increments_attempt_and_never_drops_below_floor() {
        let mut t = task(PriorityClass::Medium).with_bonus(100.0);
        let later = t.created_at + chrono::Duration::seconds(30);
        t.mark_failed("timeout");
        t.schedule_retry(0.0, later);

        assert_eq!(t.attempt, 1);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.priority_score, PriorityClass::Medium.floor());
        assert_eq!(t.visible_at, later);
        assert_eq!(t.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn absorb_priority_keeps_the_higher_score() {
        let mut t = task(PriorityClass::Low);
        assert!(!t.absorb_priority(PriorityClass::Low, 500.0));
        assert!(t.absorb_priority(PriorityClass::Critical, PriorityClass::Critical.floor()));
        assert_eq!(t.priority_class, PriorityClass::Critical);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let s = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(s, "\"IN_PROGRESS\"");
        let s = serde_json::to_string(&PriorityClass::Critical).unwrap();
        assert_eq!(s, "\"CRITICAL\"");
    }
}
