//! Queue: key layout, retry timing and the leased priority queue itself.

pub mod keys;
mod retry;
mod task_queue;

pub use keys::QueueKeys;
pub use retry::RetryPolicy;
pub use task_queue::{MAX_LEASE, QueueOptions, QueueStats, TaskQueue};
