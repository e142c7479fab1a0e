//! Domain identifiers (strongly-typed string IDs).
//!
//! Task ids are plain strings on the wire because they double as backing-store
//! keys (`task:<id>`, `locks:<id>`) and because recurring jobs carry
//! human-chosen ids such as `backup_daily`. Freshly minted ids are ULID based,
//! so they sort by creation time.
//!
//! `Id<T>` uses a phantom marker so a `TaskId` and a `WorkerId` cannot be
//! mixed up at compile time.

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Marker trait supplying the display prefix of freshly generated ids.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic string id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Wrap an existing id verbatim.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Mint a fresh, time-sortable id (`<prefix><ulid>`).
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    /// Mint an id whose timestamp component is `at`.
    ///
    /// Lets callers with an injected clock produce deterministic prefixes.
    pub fn generate_at(at: DateTime<Utc>) -> Self {
        let timestamp_ms = at.timestamp_millis().max(0) as u64;
        Self::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self::new(format!("{}{}", T::prefix(), ulid))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of one task attempt.
pub type TaskId = Id<Task>;

/// Identifier of a worker (or one of its execution slots).
pub type WorkerId = Id<Worker>;

impl TaskId {
    /// Id of retry attempt `retry_count` of the logical task rooted at `self`.
    pub fn retry_attempt(&self, retry_count: u32) -> TaskId {
        TaskId::new(format!("{}#retry-{}", self.value, retry_count))
    }

    /// Id of one firing of a recurring template.
    pub fn occurrence(&self, at: DateTime<Utc>) -> TaskId {
        TaskId::new(format!("{}_{}", self.value, at.timestamp()))
    }
}

impl WorkerId {
    /// Id of execution slot `slot` inside this worker.
    pub fn slot(&self, slot: usize) -> WorkerId {
        WorkerId::new(format!("{}_{}", self.value, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_ids_carry_prefix() {
        let task = TaskId::generate();
        let worker = WorkerId::generate();

        assert!(task.as_str().starts_with("task-"));
        assert!(worker.as_str().starts_with("worker-"));
        // let _: TaskId = worker; // <- does not compile
    }

    #[test]
    fn generated_ids_are_sortable() {
        let id1 = TaskId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::generate();

        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = TaskId::new("backup_daily");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"backup_daily\"");

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn derived_ids() {
        let root = TaskId::new("scan");
        assert_eq!(root.retry_attempt(2).as_str(), "scan#retry-2");

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(root.occurrence(at).as_str(), "scan_1704067200");

        assert_eq!(WorkerId::new("worker_0").slot(3).as_str(), "worker_0_3");
    }

    #[test]
    fn generate_at_embeds_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id = TaskId::generate_at(at);
        let ulid: Ulid = id.as_str().trim_start_matches("task-").parse().unwrap();
        assert_eq!(ulid.timestamp_ms(), at.timestamp_millis() as u64);
    }
}
