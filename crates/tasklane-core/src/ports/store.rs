//! BackingStore port - the shared store the queue is built on.
//!
//! Any store offering scored ordered sets, TTL'd keys, delete-by-pattern and
//! an atomic set-if-absent satisfies this contract (Redis being the obvious
//! production candidate). Every method is one atomic store operation; the
//! queue never holds a process-wide lock across calls.
//!
//! Patterns use glob syntax with `*` only (`tasklane:locks:*`).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A key holds a value of a different kind (string vs sorted set).
    #[error("wrong type for key {0}")]
    WrongType(String),

    #[error("store operation failed: {0}")]
    Operation(String),
}

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    // ---- ordered sets -------------------------------------------------

    /// Insert or re-score `member`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Remove `member`; `true` if it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members with `min <= score <= max`, ascending by (score, member),
    /// at most `limit` of them.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Lowest-scored member.
    async fn zfirst(&self, key: &str) -> Result<Option<ScoredMember>, StoreError>;

    /// Highest-scored member.
    async fn zlast(&self, key: &str) -> Result<Option<ScoredMember>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    // ---- key/value ----------------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Set with a time-to-live.
    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomic conditional set: succeeds only if `key` is absent.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` of any kind; `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live keys matching `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Delete every live key matching `pattern`; returns how many went.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError>;
}

/// Glob match supporting `*` (any run of characters).
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    let first = parts[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
