//! Configuration types.
//!
//! Every section is `#[serde(default)]`, so an empty file is a valid config
//! and only the values an operator cares about need to be written down.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SourceId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub reconcile: ReconcileConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub priority: PriorityRules,
    pub monitor: MonitorConfig,

    /// Per-source settings, keyed by source name.
    pub sources: BTreeMap<String, SourceConfig>,
}

impl EngineConfig {
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.keys().map(SourceId::new).collect()
    }
}

/// Where the bundled file-backed collaborators keep their data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub schedule_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            schedule_path: PathBuf::from("schedule.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub lookback_days: u32,
    pub staleness_secs: u64,

    /// How long an abandoned `(source, entity_ref)` is left out of
    /// reconciliation. `0` re-creates it on the next pass.
    pub abandoned_cooldown_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            lookback_days: 7,
            staleness_secs: 24 * 60 * 60,
            abandoned_cooldown_secs: 24 * 60 * 60,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs.min(i64::MAX as u64) as i64)
    }

    pub fn abandoned_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.abandoned_cooldown_secs.min(i64::MAX as u64 / 1000) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// maxConcurrentWorkers
    pub workers: usize,
    pub poll_interval_ms: u64,

    /// Ceiling on waiting for a rate-limit permit.
    pub permit_wait_ms: u64,
    pub fetch_timeout_secs: u64,
    pub grace_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval_ms: 500,
            permit_wait_ms: 5_000,
            fetch_timeout_secs: 30,
            grace_timeout_secs: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn permit_wait(&self) -> Duration {
        Duration::from_millis(self.permit_wait_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }

    /// Longest a worker can hold one task without a heartbeat: permit wait
    /// plus fetch timeout.
    pub fn busy_allowance(&self) -> chrono::Duration {
        self.permit_wait()
            .checked_add(self.fetch_timeout())
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    /// Fraction of the in-band bonus kept on each requeue (0.0 ..= 1.0).
    pub score_decay: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 5 * 60 * 1_000,
            score_decay: 0.5,
        }
    }
}

/// Age thresholds (event date relative to now) for deriving a priority class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityRules {
    pub critical_within_hours: u64,
    pub high_within_hours: u64,
    pub medium_within_hours: u64,
}

impl Default for PriorityRules {
    fn default() -> Self {
        Self {
            critical_within_hours: 24,
            high_within_hours: 72,
            medium_within_hours: 14 * 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub listen: String,

    /// Size of the recent-outcome ring buffer served on `/tasks`.
    pub recent_capacity: usize,

    /// Window for the "abandoned recently" counter on `/status`.
    pub recent_window_secs: u64,

    /// `/health` fails when no worker heartbeat is newer than this.
    pub liveness_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            recent_capacity: 200,
            recent_window_secs: 60 * 60,
            liveness_timeout_secs: 120,
        }
    }
}

impl MonitorConfig {
    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recent_window_secs.min(i64::MAX as u64) as i64)
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_timeout_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Token refill rate. `0` disables limiting for this source.
    pub rate_per_second: f64,
    pub burst: u32,

    /// `{entity}` is replaced by the entity ref (generic HTTP adapter only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 1.0,
            burst: 1,
            url_template: None,
        }
    }
}
