//! SourceAdapter port - one implementation per data source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::{SourceId, Task, TaskError};

/// Result of a successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchOutput {
    pub records: Vec<serde_json::Value>,

    /// Number of gaps this fetch closed (usually 1; a date-level fetch may close several).
    pub gaps_closed: usize,
}

impl FetchOutput {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self {
            records,
            gaps_closed: 1,
        }
    }

    pub fn with_gaps_closed(mut self, n: usize) -> Self {
        self.gaps_closed = n;
        self
    }
}

/// Fetches one entity from one source.
///
/// Implementations should return early once `cancel` fires; the Executor
/// also enforces its own fetch timeout on top of this.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &SourceId;

    async fn fetch(&self, task: &Task, cancel: CancellationToken) -> Result<FetchOutput, TaskError>;
}
