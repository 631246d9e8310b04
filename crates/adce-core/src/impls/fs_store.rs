//! FsStore - file-backed persistence and actual-inventory provider.
//!
//! Layout under `data_dir`:
//! - `<source>/<entity>.json`: latest fetch result per entity
//! - `terminal.jsonl`: one line per task that left the queue

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::{CollaboratorError, EntityRef, SourceId, Task, TaskStatus};
use crate::ports::{
    ActualInventory, Clock, InventoryItem, Persistence, ReconcileWindow, TerminalRecord,
};

const TERMINAL_LOG: &str = "terminal.jsonl";

/// On-disk document for one fetched entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub source: SourceId,
    pub entity_ref: EntityRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub attempt: u32,
    pub records: Vec<serde_json::Value>,
}

pub struct FsStore {
    data_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsStore {
    pub fn new(data_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            data_dir: data_dir.into(),
            clock,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn entity_path(&self, source: &SourceId, entity_ref: &EntityRef) -> PathBuf {
        self.data_dir
            .join(file_stem(source.as_str()))
            .join(format!("{}.json", file_stem(entity_ref.as_str())))
    }

    /// Read back one stored entity, if present.
    pub async fn load(
        &self,
        source: &SourceId,
        entity_ref: &EntityRef,
    ) -> Result<Option<StoredEntity>, CollaboratorError> {
        let path = self.entity_path(source, entity_ref);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_source_dir(
        &self,
        dir: &Path,
        window: &ReconcileWindow,
        out: &mut Vec<InventoryItem>,
    ) -> Result<(), CollaboratorError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let stored: StoredEntity = match serde_json::from_slice(&bytes) {
                Ok(stored) => stored,
                Err(e) => {
                    // Unreadable copy counts as missing, so it gets fetched again.
                    warn!(path = %path.display(), error = %e, "skipping unreadable stored entity");
                    continue;
                }
            };
            if stored.event_at.is_none_or(|at| window.contains(at)) {
                let mut item = InventoryItem::new(stored.source, stored.entity_ref)
                    .with_last_updated(stored.fetched_at);
                item.event_at = stored.event_at;
                out.push(item);
            }
        }
        Ok(())
    }
}

/// Bytes escaped in file names: everything but `[A-Za-z0-9._-]`. `%` is
/// escaped too, so distinct refs never share a file.
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'_').remove(b'-');

fn file_stem(raw: &str) -> String {
    utf8_percent_encode(raw, FILE_NAME).to_string()
}

#[async_trait]
impl Persistence for FsStore {
    async fn save_result(
        &self,
        task: &Task,
        records: &[serde_json::Value],
    ) -> Result<(), CollaboratorError> {
        let path = self.entity_path(&task.source, &task.entity_ref);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let doc = StoredEntity {
            source: task.source.clone(),
            entity_ref: task.entity_ref.clone(),
            event_at: task.event_at,
            fetched_at: self.clock.now(),
            attempt: task.attempt,
            records: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            task_id = %task.id,
            path = %path.display(),
            records = records.len(),
            "result saved"
        );
        Ok(())
    }

    async fn save_terminal(
        &self,
        task: &Task,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), CollaboratorError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let record = TerminalRecord::new(task, status, reason, self.clock.now());
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(TERMINAL_LOG))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ActualInventory for FsStore {
    async fn list_actual(
        &self,
        window: &ReconcileWindow,
    ) -> Result<Vec<InventoryItem>, CollaboratorError> {
        let mut items = Vec::new();
        let mut sources = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = sources.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                self.read_source_dir(&entry.path(), window, &mut items).await?;
            }
        }
        Ok(items)
    }
}
