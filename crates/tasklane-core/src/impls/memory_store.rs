//! MemoryStore - in-process backing store.
//!
//! Implements the full `BackingStore` contract (sorted sets, TTL'd strings,
//! set-if-absent, pattern deletes) behind one async mutex, so each trait call
//! is atomic exactly like a single Redis command. Expired keys are dropped
//! lazily on access and by a periodic sweep on writes.
//!
//! Good for tests, demos and single-process deployments; several workers in
//! one process share it through an `Arc`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ports::{BackingStore, ScoredMember, StoreError, glob_match};

/// Writes between full expiry sweeps.
const SWEEP_EVERY: u64 = 1024;

/// f64 score with a total order.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    /// Ordered by (score, member), like a Redis zset.
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(Score(old), member.to_string()));
        }
        self.order.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn scored(entry: &(Score, String)) -> ScoredMember {
        ScoredMember {
            member: entry.1.clone(),
            score: entry.0.0,
        }
    }
}

#[derive(Debug)]
enum Value {
    Text(String),
    Sorted(SortedSet),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    slots: HashMap<String, Slot>,
    writes: u64,
}

impl StoreState {
    /// Live slot for `key`, evicting it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Slot> {
        if self.slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn sorted(&mut self, key: &str, now: Instant) -> Result<Option<&mut SortedSet>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot {
                value: Value::Sorted(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_or_create(&mut self, key: &str, now: Instant) -> Result<&mut SortedSet, StoreError> {
        if self.live(key, now).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Sorted(SortedSet::default()),
                    expires_at: None,
                },
            );
        }
        self.sorted(key, now)?
            .ok_or_else(|| StoreError::Operation(format!("sorted set {key} vanished")))
    }

    fn put_text(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: Instant) -> Result<(), StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                now.checked_add(ttl)
                    .ok_or_else(|| StoreError::Operation(format!("invalid expire time for {key}")))?,
            ),
            None => None,
        };
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    fn note_write(&mut self, now: Instant) {
        self.writes += 1;
        if self.writes % SWEEP_EVERY == 0 {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: Instant) {
        self.slots.retain(|_, slot| slot.is_live(now));
    }

    fn live_keys(&mut self, pattern: &str, now: Instant) -> Vec<String> {
        self.sweep(now);
        self.slots
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect()
    }
}

/// In-process `BackingStore`.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    /// Remaining time-to-live of `key`, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state
            .live(key, now)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.sorted_or_create(key, now)?.insert(member, score);
        state.note_write(now);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let removed = match state.sorted(key, now)? {
            Some(set) => set.remove(member),
            None => false,
        };
        state.note_write(now);
        Ok(removed)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted(key, now)? else {
            return Ok(Vec::new());
        };
        Ok(set
            .order
            .iter()
            .skip_while(|(score, _)| score.0 < min)
            .take_while(|(score, _)| score.0 <= max)
            .take(limit)
            .map(SortedSet::scored)
            .collect())
    }

    async fn zfirst(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state
            .sorted(key, now)?
            .and_then(|set| set.order.first().map(SortedSet::scored)))
    }

    async fn zlast(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state
            .sorted(key, now)?
            .and_then(|set| set.order.last().map(SortedSet::scored)))
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state.sorted(key, now)?.map_or(0, |set| set.scores.len()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.live(key, now) {
            None => Ok(None),
            Some(Slot {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.put_text(key, value, None, now)?;
        state.note_write(now);
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        if ttl.is_zero() {
            return Err(StoreError::Operation(format!("invalid expire time for {key}")));
        }
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.put_text(key, value, Some(ttl), now)?;
        state.note_write(now);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        if ttl.is_zero() {
            return Err(StoreError::Operation(format!("invalid expire time for {key}")));
        }
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.put_text(key, value, Some(ttl), now)?;
        state.note_write(now);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let existed = state.live(key, now).is_some();
        state.slots.remove(key);
        state.note_write(now);
        Ok(existed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state.live_keys(pattern, now))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let doomed = state.live_keys(pattern, now);
        for key in &doomed {
            state.slots.remove(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn sorted_set_orders_by_score_then_member() {
        let store = MemoryStore::new();
        store.zadd("q", "late", 30.0).await.unwrap();
        store.zadd("q", "b", 10.0).await.unwrap();
        store.zadd("q", "a", 10.0).await.unwrap();
        store.zadd("q", "mid", 20.0).await.unwrap();

        let members: Vec<String> = store
            .zrange_by_score("q", 0.0, 25.0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.member)
            .collect();
        assert_eq!(members, vec!["a", "b", "mid"]);

        assert_eq!(store.zfirst("q").await.unwrap().unwrap().member, "a");
        assert_eq!(store.zlast("q").await.unwrap().unwrap().member, "late");
        assert_eq!(store.zcard("q").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn zadd_rescores_existing_member() {
        let store = MemoryStore::new();
        store.zadd("q", "t", 50.0).await.unwrap();
        store.zadd("q", "t", 5.0).await.unwrap();

        assert_eq!(store.zcard("q").await.unwrap(), 1);
        let first = store.zfirst("q").await.unwrap().unwrap();
        assert_eq!(first.score, 5.0);
    }

    #[tokio::test]
    async fn zrange_respects_limit_and_bounds() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store.zadd("q", &format!("m{i}"), i as f64).await.unwrap();
        }
        let got = store.zrange_by_score("q", 2.0, 8.0, 3).await.unwrap();
        let scores: Vec<f64> = got.iter().map(|m| m.score).collect();
        assert_eq!(scores, vec![2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn zrem_reports_presence() {
        let store = MemoryStore::new();
        store.zadd("q", "t", 1.0).await.unwrap();
        assert!(store.zrem("q", "t").await.unwrap());
        assert!(!store.zrem("q", "t").await.unwrap());
        assert!(!store.zrem("missing", "t").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn setex_expires() {
        let store = MemoryStore::new();
        store.setex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.ttl("k").await.unwrap() <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_rejected_without_writing() {
        let store = MemoryStore::new();
        let err = store.setex("k", "v", Duration::MAX).await.unwrap_err();
        assert!(matches!(err, StoreError::Operation(_)));
        assert!(store.set_nx_ex("lock", "w1", Duration::MAX).await.is_err());

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_ex_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", "w1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx_ex("lock", "w2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("w1"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_nx_ex("lock", "w2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_set_nx_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_nx_ex("lock", &format!("w{i}"), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn pattern_operations() {
        let store = MemoryStore::new();
        store.set("app:results:a", "1").await.unwrap();
        store.set("app:results:b", "2").await.unwrap();
        store.set("app:locks:a", "w").await.unwrap();

        let mut keys = store.keys("app:results:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["app:results:a", "app:results:b"]);

        assert_eq!(store.delete_pattern("app:results:*").await.unwrap(), 2);
        assert!(store.keys("app:results:*").await.unwrap().is_empty());
        assert_eq!(store.keys("app:*").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert!(matches!(
            store.zadd("k", "m", 1.0).await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
