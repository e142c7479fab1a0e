//! Key layout in the backing store.
//!
//! ```text
//! {q}:priority:{value}   sorted set of pending ids, scored by eligibility (µs)
//! {q}:task:{id}          encoded TaskDefinition (payload TTL)
//! {q}:expire:{id}        expiry marker, RFC 3339 instant (payload TTL)
//! {q}:results:{id}       encoded TaskResult (result TTL)
//! {q}:locks:{id}         claim lease, value = worker id
//! {q}:running            sorted set of claimed ids, scored by lease deadline (µs)
//! ```

use chrono::{DateTime, Utc};

use crate::domain::{TaskId, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn bucket(&self, priority: TaskPriority) -> String {
        format!("{}:priority:{}", self.prefix, priority.value())
    }

    pub fn task(&self, id: &TaskId) -> String {
        format!("{}:task:{id}", self.prefix)
    }

    pub fn expire(&self, id: &TaskId) -> String {
        format!("{}:expire:{id}", self.prefix)
    }

    pub fn result(&self, id: &TaskId) -> String {
        format!("{}:results:{id}", self.prefix)
    }

    pub fn lock(&self, id: &TaskId) -> String {
        format!("{}:locks:{id}", self.prefix)
    }

    pub fn running(&self) -> String {
        format!("{}:running", self.prefix)
    }

    pub fn results_pattern(&self) -> String {
        format!("{}:results:*", self.prefix)
    }

    pub fn locks_pattern(&self) -> String {
        format!("{}:locks:*", self.prefix)
    }
}

/// Sorted-set score for an instant. Exact for any realistic date.
pub fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64
}

/// Inverse of [`score`].
pub fn instant(score: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(score as i64)
}
