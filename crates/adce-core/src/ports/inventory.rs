//! Inventory ports: what *should* exist vs what *does* exist.
//!
//! Both providers must return an explicit error when they cannot answer;
//! an empty `Vec` means "nothing in the window", never "unknown".

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CollaboratorError, DedupKey, EntityRef, SourceId};

/// Bounded look-back window of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReconcileWindow {
    /// `[now - lookback, now]`
    pub fn trailing(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            start: now - lookback,
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// One unit of inventory, expected or actual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub source: SourceId,
    pub entity_ref: EntityRef,

    /// Date the entity refers to (drives priority).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_at: Option<DateTime<Utc>>,

    /// When the stored copy was last refreshed (actual inventory only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl InventoryItem {
    pub fn new(source: SourceId, entity_ref: EntityRef) -> Self {
        Self {
            source,
            entity_ref,
            event_at: None,
            last_updated: None,
        }
    }

    pub fn with_event_at(mut self, at: DateTime<Utc>) -> Self {
        self.event_at = Some(at);
        self
    }

    pub fn with_last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn key(&self) -> DedupKey {
        (self.source.clone(), self.entity_ref.clone())
    }
}

/// Ground truth of what should be stored (e.g. a schedule).
#[async_trait]
pub trait ExpectedInventory: Send + Sync {
    async fn list_expected(
        &self,
        window: &ReconcileWindow,
    ) -> Result<Vec<InventoryItem>, CollaboratorError>;
}

/// What storage currently holds (e.g. a presence check).
#[async_trait]
pub trait ActualInventory: Send + Sync {
    async fn list_actual(
        &self,
        window: &ReconcileWindow,
    ) -> Result<Vec<InventoryItem>, CollaboratorError>;
}
