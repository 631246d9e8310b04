//! Persistence port - fetched records and terminal task records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CollaboratorError, EntityRef, SourceId, Task, TaskId, TaskStatus};

/// Storage collaborator used by the Executor (results) and the queue (terminal records).
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store what a successful fetch returned.
    async fn save_result(
        &self,
        task: &Task,
        records: &[serde_json::Value],
    ) -> Result<(), CollaboratorError>;

    /// Record a task leaving the queue for good (`Done` or `Abandoned`).
    async fn save_terminal(
        &self,
        task: &Task,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), CollaboratorError>;
}

/// Serializable form of a terminal task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub task_id: TaskId,
    pub source: SourceId,
    pub entity_ref: EntityRef,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TerminalRecord {
    pub fn new(
        task: &Task,
        status: TaskStatus,
        reason: Option<&str>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.id,
            source: task.source.clone(),
            entity_ref: task.entity_ref.clone(),
            status,
            attempt: task.attempt,
            reason: reason.map(str::to_owned),
            recorded_at,
        }
    }
}
