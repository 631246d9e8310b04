//! Lock-free queue gauges.
//!
//! The queue updates these on every mutation while it holds its own lock;
//! readers (`/status`, tests) only load atomics.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::PriorityClass;

const NO_PENDING: i64 = i64::MIN;

#[derive(Debug)]
pub struct QueueGauges {
    depth: [AtomicUsize; 4],
    delayed: AtomicUsize,
    in_flight: AtomicUsize,

    /// `created_at` of the oldest pending task, unix millis.
    oldest_pending_ms: AtomicI64,
}

impl Default for QueueGauges {
    fn default() -> Self {
        Self {
            depth: Default::default(),
            delayed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            oldest_pending_ms: AtomicI64::new(NO_PENDING),
        }
    }
}

impl QueueGauges {
    pub(crate) fn publish(
        &self,
        depth: &[usize; 4],
        delayed: usize,
        in_flight: usize,
        oldest_pending: Option<DateTime<Utc>>,
    ) {
        for (gauge, value) in self.depth.iter().zip(depth) {
            gauge.store(*value, Ordering::Relaxed);
        }
        self.delayed.store(delayed, Ordering::Relaxed);
        self.in_flight.store(in_flight, Ordering::Relaxed);
        self.oldest_pending_ms.store(
            oldest_pending.map_or(NO_PENDING, |t| t.timestamp_millis()),
            Ordering::Relaxed,
        );
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let depth_of = |class: PriorityClass| self.depth[class.index()].load(Ordering::Relaxed);
        let depth = ClassDepth {
            critical: depth_of(PriorityClass::Critical),
            high: depth_of(PriorityClass::High),
            medium: depth_of(PriorityClass::Medium),
            low: depth_of(PriorityClass::Low),
        };

        let oldest = self.oldest_pending_ms.load(Ordering::Relaxed);
        let oldest_pending_age_secs = (oldest != NO_PENDING)
            .then(|| ((now.timestamp_millis() - oldest).max(0) as f64) / 1000.0);

        QueueSnapshot {
            total_pending: depth.total(),
            depth,
            delayed: self.delayed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            oldest_pending_age_secs,
        }
    }
}

/// Pending tasks per priority class (delayed ones included).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDepth {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl ClassDepth {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }

    pub fn get(&self, class: PriorityClass) -> usize {
        match class {
            PriorityClass::Critical => self.critical,
            PriorityClass::High => self.high,
            PriorityClass::Medium => self.medium,
            PriorityClass::Low => self.low,
        }
    }
}

/// Point-in-time view of the queue. Derived, never stored as engine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub depth: ClassDepth,
    pub total_pending: usize,

    /// Pending but still inside their backoff window.
    pub delayed: usize,
    pub in_flight: usize,
    pub oldest_pending_age_secs: Option<f64>,
}
