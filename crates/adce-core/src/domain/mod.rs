//! Domain model: ids, tasks, errors.

pub mod errors;
pub mod ids;
pub mod task;

pub use errors::{CollaboratorError, ErrorClass, TaskError};
pub use ids::{PassId, TaskId};
pub use task::{DedupKey, EntityRef, PriorityClass, SourceId, Task, TaskStatus};
