//! ScheduleFile - expected inventory read from a JSON file.
//!
//! ```json
//! [
//!   { "source": "espn", "entity_ref": "game:401584", "event_at": "2024-03-09T19:00:00Z" }
//! ]
//! ```
//!
//! The file is re-read on every pass so an external job can refresh it.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::CollaboratorError;
use crate::ports::{ExpectedInventory, InventoryItem, ReconcileWindow};

pub struct ScheduleFile {
    path: PathBuf,
}

impl ScheduleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExpectedInventory for ScheduleFile {
    async fn list_expected(
        &self,
        window: &ReconcileWindow,
    ) -> Result<Vec<InventoryItem>, CollaboratorError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            CollaboratorError::Inventory(format!(
                "cannot read schedule {}: {e}",
                self.path.display()
            ))
        })?;
        let items: Vec<InventoryItem> = serde_json::from_slice(&bytes)?;
        Ok(items
            .into_iter()
            .filter(|item| item.event_at.is_none_or(|at| window.contains(at)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_items_inside_the_window() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("schedule.json");
        std::fs::write(
            &path,
            r#"[
                {"source": "espn", "entity_ref": "g1", "event_at": "2024-03-09T19:00:00Z"},
                {"source": "espn", "entity_ref": "g2", "event_at": "2024-01-01T19:00:00Z"}
            ]"#,
        )
        .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let window = ReconcileWindow::trailing(now, Duration::days(7));
        let items = ScheduleFile::new(&path).list_expected(&window).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].entity_ref.as_str(), "g1");
    }

    #[tokio::test]
    async fn missing_file_is_an_error_not_an_empty_list() {
        let temp = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let window = ReconcileWindow::trailing(now, Duration::days(7));

        let err = ScheduleFile::new(temp.path().join("nope.json"))
            .list_expected(&window)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Inventory(_)));
    }
}
