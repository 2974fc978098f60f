//! Cache Capability
//!
//! A Redis-shaped key-value + sorted-set capability consumed by the
//! reserve engine, DLQ, JTI guard, and credit-note layer. The real
//! deployment backs this with Redis and registers the multi-key
//! operations as server-side scripts; the in-memory implementation
//! runs them under a single lock, which gives the same atomicity to
//! everything in-process (and to tests).
//!
//! Connection health is observable via `is_healthy`; consumers decide
//! individually whether to fail open or closed when it is down.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Connection down or command timed out.
    Unavailable,
    /// Stored value did not parse as what the caller expected.
    Corrupt(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Unavailable => write!(f, "cache unavailable"),
            CacheError::Corrupt(msg) => write!(f, "corrupt cache value: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

/// Outcome of the scripted reserve compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveScriptOutcome {
    Reserved,
    InsufficientFunds { available: String },
    /// Reservation key already exists (id collision or replay).
    Conflict,
}

/// Redis-like capability. All `&str` money values are canonical
/// decimal strings; scores are integer milliseconds.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// SET NX: returns true when the key was absent and is now set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool>;

    async fn del(&self, key: &str) -> CacheResult<bool>;

    /// Atomic GET + DEL.
    async fn take(&self, key: &str) -> CacheResult<Option<String>>;

    /// Atomic RENAME. Returns false when the source key is absent.
    async fn rename(&self, src: &str, dst: &str) -> CacheResult<bool>;

    /// Atomic decimal increment on a balance key. Missing keys read
    /// as `"0"`. Returns the new value.
    async fn incr_decimal(&self, key: &str, delta: &str) -> CacheResult<String>;

    /// Atomic multi-key decimal increments (one script invocation).
    async fn apply_deltas(&self, deltas: &[(String, String)]) -> CacheResult<Vec<String>>;

    /// Scripted reserve: if `available >= amount`, move `amount` from
    /// the available key to the held key and create the reservation
    /// key (NX, with TTL) in one atomic step.
    async fn reserve_if_available(
        &self,
        available_key: &str,
        held_key: &str,
        reservation_key: &str,
        amount: &str,
        reservation_json: &str,
        ttl: Duration,
    ) -> CacheResult<ReserveScriptOutcome>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> CacheResult<()>;

    /// Members with score <= max_score, ascending, up to `limit`.
    async fn zrangebyscore(&self, key: &str, max_score: i64, limit: usize) -> CacheResult<Vec<String>>;

    async fn zpopmin(&self, key: &str) -> CacheResult<Option<(String, i64)>>;

    async fn zcard(&self, key: &str) -> CacheResult<u64>;

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<bool>;

    fn is_healthy(&self) -> bool;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(t) => now < t,
            None => true,
        }
    }
}

#[derive(Default)]
struct MemoryCacheInner {
    kv: HashMap<String, ValueEntry>,
    /// member -> score, plus a score-ordered set for range scans.
    zscores: HashMap<String, HashMap<String, i64>>,
    zordered: HashMap<String, BTreeSet<(i64, String)>>,
}

impl MemoryCacheInner {
    fn get_live(&mut self, key: &str, now: Instant) -> Option<&ValueEntry> {
        let expired = match self.kv.get(key) {
            Some(entry) => !entry.live(now),
            None => return None,
        };
        if expired {
            self.kv.remove(key);
            return None;
        }
        self.kv.get(key)
    }

    fn incr_decimal(&mut self, key: &str, delta: &str, now: Instant) -> CacheResult<String> {
        use crate::billing::money::MicroUsd;
        let current = match self.get_live(key, now) {
            Some(entry) => MicroUsd::parse_canonical(&entry.value)
                .map_err(|e| CacheError::Corrupt(format!("{}: {}", key, e)))?,
            None => MicroUsd::zero(),
        };
        let delta = MicroUsd::parse_canonical(delta)
            .map_err(|e| CacheError::Corrupt(format!("delta: {}", e)))?;
        let next = current + delta;
        let wire = next.to_wire();
        self.kv.insert(
            key.to_string(),
            ValueEntry {
                value: wire.clone(),
                expires_at: None,
            },
        );
        Ok(wire)
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let removed = match self.zscores.get_mut(key) {
            Some(scores) => scores.remove(member),
            None => None,
        };
        if let Some(score) = removed {
            if let Some(ordered) = self.zordered.get_mut(key) {
                ordered.remove(&(score, member.to_string()));
            }
            true
        } else {
            false
        }
    }
}

/// Single-process cache. Every trait method takes the one lock, which
/// is what makes the "scripts" atomic.
pub struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
    healthy: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            inner: Mutex::new(MemoryCacheInner::default()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Test hook: simulate an outage.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check(&self) -> CacheResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable)
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        let mut inner = self.inner.lock();
        Ok(inner.get_live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.kv.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.get_live(key, now).is_some() {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        Ok(self.inner.lock().kv.remove(key).is_some())
    }

    async fn take(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.get_live(key, now).is_none() {
            return Ok(None);
        }
        Ok(inner.kv.remove(key).map(|e| e.value))
    }

    async fn rename(&self, src: &str, dst: &str) -> CacheResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.get_live(src, now).is_none() {
            return Ok(false);
        }
        match inner.kv.remove(src) {
            Some(entry) => {
                inner.kv.insert(dst.to_string(), entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_decimal(&self, key: &str, delta: &str) -> CacheResult<String> {
        self.check()?;
        self.inner.lock().incr_decimal(key, delta, Instant::now())
    }

    async fn apply_deltas(&self, deltas: &[(String, String)]) -> CacheResult<Vec<String>> {
        self.check()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut out = Vec::with_capacity(deltas.len());
        for (key, delta) in deltas {
            out.push(inner.incr_decimal(key, delta, now)?);
        }
        Ok(out)
    }

    async fn reserve_if_available(
        &self,
        available_key: &str,
        held_key: &str,
        reservation_key: &str,
        amount: &str,
        reservation_json: &str,
        ttl: Duration,
    ) -> CacheResult<ReserveScriptOutcome> {
        use crate::billing::money::MicroUsd;
        self.check()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.get_live(reservation_key, now).is_some() {
            return Ok(ReserveScriptOutcome::Conflict);
        }

        let available = match inner.get_live(available_key, now) {
            Some(entry) => MicroUsd::parse_canonical(&entry.value)
                .map_err(|e| CacheError::Corrupt(format!("{}: {}", available_key, e)))?,
            None => MicroUsd::zero(),
        };
        let amount = MicroUsd::parse_canonical(amount)
            .map_err(|e| CacheError::Corrupt(format!("amount: {}", e)))?;

        if available < amount {
            return Ok(ReserveScriptOutcome::InsufficientFunds {
                available: available.to_wire(),
            });
        }

        let neg = (-amount.clone()).to_wire();
        inner.incr_decimal(available_key, &neg, now)?;
        inner.incr_decimal(held_key, &amount.to_wire(), now)?;
        inner.kv.insert(
            reservation_key.to_string(),
            ValueEntry {
                value: reservation_json.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(ReserveScriptOutcome::Reserved)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> CacheResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        // ZADD updates the score of an existing member.
        if let Some(old) = inner
            .zscores
            .get(key)
            .and_then(|scores| scores.get(member))
            .copied()
        {
            if let Some(ordered) = inner.zordered.get_mut(key) {
                ordered.remove(&(old, member.to_string()));
            }
        }
        inner
            .zscores
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        inner
            .zordered
            .entry(key.to_string())
            .or_default()
            .insert((score, member.to_string()));
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max_score: i64, limit: usize) -> CacheResult<Vec<String>> {
        self.check()?;
        let inner = self.inner.lock();
        let Some(ordered) = inner.zordered.get(key) else {
            return Ok(Vec::new());
        };
        Ok(ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zpopmin(&self, key: &str) -> CacheResult<Option<(String, i64)>> {
        self.check()?;
        let mut inner = self.inner.lock();
        let first = inner
            .zordered
            .get(key)
            .and_then(|ordered| ordered.iter().next().cloned());
        match first {
            Some((score, member)) => {
                inner.zrem(key, &member);
                Ok(Some((member, score)))
            }
            None => Ok(None),
        }
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner.zscores.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.check()?;
        Ok(self.inner.lock().zrem(key, member))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_semantics() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("jti:abc", "1", None).await.unwrap());
        assert!(!cache.set_nx("jti:abc", "1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        // Expired key is free for NX again.
        assert!(cache.set_nx("k", "v2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_decimal_big_values() {
        let cache = MemoryCache::new();
        let v = cache
            .incr_decimal("balance:u1:value", "99999999999999999999")
            .await
            .unwrap();
        assert_eq!(v, "99999999999999999999");
        let v = cache.incr_decimal("balance:u1:value", "-1").await.unwrap();
        assert_eq!(v, "99999999999999999998");
    }

    #[tokio::test]
    async fn test_reserve_script_cas() {
        let cache = MemoryCache::new();
        cache.set("balance:u1:available", "100", None).await.unwrap();

        let outcome = cache
            .reserve_if_available(
                "balance:u1:available",
                "balance:u1:held",
                "reservation:r1",
                "80",
                "{}",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReserveScriptOutcome::Reserved);
        assert_eq!(
            cache.get("balance:u1:available").await.unwrap(),
            Some("20".to_string())
        );
        assert_eq!(
            cache.get("balance:u1:held").await.unwrap(),
            Some("80".to_string())
        );

        // Second reserve exceeds what is left.
        let outcome = cache
            .reserve_if_available(
                "balance:u1:available",
                "balance:u1:held",
                "reservation:r2",
                "21",
                "{}",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReserveScriptOutcome::InsufficientFunds {
                available: "20".to_string()
            }
        );

        // Same reservation id again is a conflict, not a double-debit.
        let outcome = cache
            .reserve_if_available(
                "balance:u1:available",
                "balance:u1:held",
                "reservation:r1",
                "1",
                "{}",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReserveScriptOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_zset_ordering_and_limit() {
        let cache = MemoryCache::new();
        cache.zadd("sched", "c", 300).await.unwrap();
        cache.zadd("sched", "a", 100).await.unwrap();
        cache.zadd("sched", "b", 200).await.unwrap();

        assert_eq!(cache.zcard("sched").await.unwrap(), 3);
        assert_eq!(
            cache.zrangebyscore("sched", 250, 10).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            cache.zrangebyscore("sched", 1000, 1).await.unwrap(),
            vec!["a".to_string()]
        );

        // ZADD re-scores an existing member.
        cache.zadd("sched", "a", 400).await.unwrap();
        assert_eq!(
            cache.zrangebyscore("sched", 1000, 10).await.unwrap(),
            vec!["b".to_string(), "c".to_string(), "a".to_string()]
        );
        assert_eq!(cache.zcard("sched").await.unwrap(), 3);

        let popped = cache.zpopmin("sched").await.unwrap();
        assert_eq!(popped, Some(("b".to_string(), 200)));
        assert_eq!(cache.zcard("sched").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_cache_fails_all_ops() {
        let cache = MemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        cache.set_healthy(false);
        assert!(!cache.is_healthy());
        assert_eq!(cache.get("k").await.unwrap_err(), CacheError::Unavailable);
        assert_eq!(
            cache.set_nx("jti:x", "1", None).await.unwrap_err(),
            CacheError::Unavailable
        );
        cache.set_healthy(true);
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_take_is_get_and_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.take("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.take("k").await.unwrap(), None);
    }
}
