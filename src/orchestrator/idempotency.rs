//! Tool-Call Idempotency Cache
//!
//! Keyed by (trace_id, tool_name, canonicalized args). A replayed
//! tool call inside the same trace returns the cached result instead
//! of re-executing the side effect. Bounded by capacity (insertion
//! order eviction) and per-entry TTL.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedResult {
    value: serde_json::Value,
    stored_at: Instant,
}

pub struct IdempotencyCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CachedResult>,
    order: VecDeque<String>,
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        IdempotencyCache {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Canonical cache key. Args are serialized from the parsed value
    /// so formatting differences in the raw argument string do not
    /// split the key.
    pub fn key(trace_id: &str, tool_name: &str, args: &serde_json::Value) -> String {
        format!("{}:{}:{}", trace_id, tool_name, args)
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: String, value: serde_json::Value) {
        let mut inner = self.inner.lock();
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if inner.entries.insert(key.clone(), CachedResult {
            value,
            stored_at: Instant::now(),
        }).is_none() {
            inner.order.push_back(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_canonicalizes_args() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{ "x" : 1 , "y" : 2 }"#).unwrap();
        assert_eq!(
            IdempotencyCache::key("t", "tool", &a),
            IdempotencyCache::key("t", "tool", &b)
        );
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = IdempotencyCache::new(10, Duration::from_secs(60));
        let key = IdempotencyCache::key("t1", "lookup", &json!({"id": 7}));
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), json!({"result": "ok"}));
        assert_eq!(cache.get(&key), Some(json!({"result": "ok"})));

        // Different trace, same call: distinct key.
        let other = IdempotencyCache::key("t2", "lookup", &json!({"id": 7}));
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn test_capacity_eviction_in_insertion_order() {
        let cache = IdempotencyCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), json!(1));
        cache.put("b".into(), json!(2));
        cache.put("c".into(), json!(3));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = IdempotencyCache::new(10, Duration::from_millis(0));
        cache.put("k".into(), json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }
}
