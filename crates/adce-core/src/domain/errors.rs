//! Error taxonomy.
//!
//! - `TaskError`: outcome of one fetch; never escapes the worker loop
//! - `CollaboratorError`: inventory / persistence providers; aborts the current operation only
//! - `ConfigError` (in `config`): fatal, startup only

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operational class of an error, as reported on `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Recoverable,
    Permanent,
    Collaborator,
    Configuration,
}

/// Failure of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Timeout, upstream rate limit, transient network trouble. Requeue with backoff.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Malformed entity reference, permanent rejection. Abandon, no retry.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TaskError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::Recoverable(_) => ErrorClass::Recoverable,
            TaskError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaskError::Recoverable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Recoverable(m) | TaskError::Permanent(m) => m,
        }
    }
}

/// Failure of an external collaborator (inventory, persistence).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("inventory provider failed: {0}")]
    Inventory(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("collaborator I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collaborator data error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CollaboratorError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Collaborator
    }
}
