//! Queue module: priority ordering, deduplication, retry policy and lock-free gauges.

mod memory;
mod retry;
mod snapshot;

pub use memory::{QueueError, RequeueOutcome, TaskQueue};
pub use retry::RetryPolicy;
pub use snapshot::{ClassDepth, QueueGauges, QueueSnapshot};
