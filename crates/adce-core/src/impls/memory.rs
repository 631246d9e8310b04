//! In-memory collaborators (tests, embedding).
//!
//! Both types can be told to fail so error paths are easy to drive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{CollaboratorError, Task, TaskId, TaskStatus};
use crate::ports::{
    ActualInventory, ExpectedInventory, InventoryItem, Persistence, ReconcileWindow,
    TerminalRecord,
};

/// Records saved by a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedResult {
    pub task_id: TaskId,
    pub task: Task,
    pub records: Vec<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    results: Mutex<Vec<SavedResult>>,
    terminal: Mutex<Vec<TerminalRecord>>,
    fail_results: AtomicBool,
    fail_terminal: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<SavedResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn terminal_records(&self) -> Vec<TerminalRecord> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make `save_result` fail until switched back.
    pub fn fail_results(&self, fail: bool) {
        self.fail_results.store(fail, Ordering::SeqCst);
    }

    /// Make `save_terminal` fail until switched back.
    pub fn fail_terminal(&self, fail: bool) {
        self.fail_terminal.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn save_result(
        &self,
        task: &Task,
        records: &[serde_json::Value],
    ) -> Result<(), CollaboratorError> {
        if self.fail_results.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Persistence("result store unavailable".into()));
        }
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SavedResult {
                task_id: task.id,
                task: task.clone(),
                records: records.to_vec(),
            });
        Ok(())
    }

    async fn save_terminal(
        &self,
        task: &Task,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), CollaboratorError> {
        if self.fail_terminal.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Persistence("terminal store unavailable".into()));
        }
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TerminalRecord::new(task, status, reason, Utc::now()));
        Ok(())
    }
}

/// Fixed list of inventory items; serves as either provider.
///
/// Items without `event_at` are always in the window.
#[derive(Debug, Default)]
pub struct StaticInventory {
    items: Mutex<Vec<InventoryItem>>,
    failure: Mutex<Option<String>>,
}

impl StaticInventory {
    pub fn new(items: Vec<InventoryItem>) -> Self {
        Self {
            items: Mutex::new(items),
            failure: Mutex::new(None),
        }
    }

    pub fn set_items(&self, items: Vec<InventoryItem>) {
        *self.items.lock().unwrap_or_else(PoisonError::into_inner) = items;
    }

    pub fn push(&self, item: InventoryItem) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    /// Fail every listing with `message` until `recover` is called.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn list(&self, window: &ReconcileWindow) -> Result<Vec<InventoryItem>, CollaboratorError> {
        if let Some(message) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(CollaboratorError::Inventory(message));
        }
        Ok(self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|item| item.event_at.is_none_or(|at| window.contains(at)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExpectedInventory for StaticInventory {
    async fn list_expected(
        &self,
        window: &ReconcileWindow,
    ) -> Result<Vec<InventoryItem>, CollaboratorError> {
        self.list(window)
    }
}

#[async_trait]
impl ActualInventory for StaticInventory {
    async fn list_actual(
        &self,
        window: &ReconcileWindow,
    ) -> Result<Vec<InventoryItem>, CollaboratorError> {
        self.list(window)
    }
}
