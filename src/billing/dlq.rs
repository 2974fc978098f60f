//! Finalization Dead-Letter Queue
//!
//! Finalize failures with a retryable cause land here. Entries are
//! keyed by reservation_id, scheduled through a sorted set scored by
//! `next_attempt_at_ms`, claimed with a SET-NX lock so exactly one
//! replayer wins, and bounded: when `attempt_count` reaches the cap
//! the payload moves to a terminal keyspace (one atomic RENAME) where
//! it is retained for audit. Terminal drops are also journalled to
//! the WAL, which is authoritative for the audit trail.
//!
//! Key layout:
//!
//! ```text
//! {prefix}:entry:{rid}     JSON payload (active)
//! {prefix}:schedule        ZSET score = next_attempt_at_ms
//! {prefix}:lock:{rid}      claim lock, TTL
//! {prefix}:terminal:{rid}  post-terminal archive
//! ```

use crate::billing::cache::{Cache, CacheResult};
use crate::billing::money::MicroUsd;
use crate::billing::wal::WalSink;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

pub const WAL_NAMESPACE_DLQ: &str = "dlq";

/// One queued finalization retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub reservation_id: String,
    pub tenant_id: String,
    pub actual_cost: MicroUsd,
    pub trace_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    pub attempt_count: u32,
    pub next_attempt_at_ms: i64,
    /// Immutable across upserts.
    pub created_at_ms: i64,
}

/// Upsert input; schedule fields are computed by the store.
#[derive(Debug, Clone)]
pub struct DlqUpsert {
    pub reservation_id: String,
    pub tenant_id: String,
    pub actual_cost: MicroUsd,
    pub trace_id: String,
    pub reason: String,
    pub response_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Scheduled {
        attempt_count: u32,
        next_attempt_at_ms: i64,
    },
    /// Attempt cap reached; the entry moved to the terminal keyspace.
    TerminalDropped { attempt_count: u32 },
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub prefix: String,
    /// Attempt cap. Reaching it terminal-drops the entry.
    pub max_retries: u32,
    pub claim_ttl: Duration,
    pub backoff_base: Duration,
    /// Per-attempt upper bound on backoff.
    pub backoff_max: Duration,
    /// ± fraction applied to the computed backoff.
    pub jitter_pct: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        DlqConfig {
            prefix: "dlq".to_string(),
            max_retries: 5,
            claim_ttl: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(15 * 60),
            jitter_pct: 0.2,
        }
    }
}

pub struct DlqStore {
    cache: Arc<dyn Cache>,
    wal: Arc<dyn WalSink>,
    config: DlqConfig,
    /// True for the no-durability in-memory fallback.
    degraded: bool,
}

impl DlqStore {
    pub fn new(cache: Arc<dyn Cache>, wal: Arc<dyn WalSink>, config: DlqConfig) -> Self {
        DlqStore {
            cache,
            wal,
            config,
            degraded: false,
        }
    }

    /// In-memory fallback for environments without a cache. Carries
    /// no durability guarantee and is flagged degraded.
    pub fn degraded_in_memory(wal: Arc<dyn WalSink>, config: DlqConfig) -> Self {
        warn!("dlq running on in-memory fallback; queued retries will not survive a restart");
        metrics::increment_counter!("dlq_degraded_mode_total");
        DlqStore {
            cache: Arc::new(crate::billing::cache::MemoryCache::new()),
            wal,
            config,
            degraded: true,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn entry_key(&self, rid: &str) -> String {
        format!("{}:entry:{}", self.config.prefix, rid)
    }

    fn schedule_key(&self) -> String {
        format!("{}:schedule", self.config.prefix)
    }

    fn lock_key(&self, rid: &str) -> String {
        format!("{}:lock:{}", self.config.prefix, rid)
    }

    fn terminal_key(&self, rid: &str) -> String {
        format!("{}:terminal:{}", self.config.prefix, rid)
    }

    /// Exponential backoff with a per-attempt upper bound and ±jitter.
    fn backoff_ms(&self, attempt_count: u32) -> i64 {
        let exp = attempt_count.saturating_sub(1).min(20);
        let base = self.config.backoff_base.as_millis() as f64 * (1u64 << exp) as f64;
        let capped = base.min(self.config.backoff_max.as_millis() as f64);
        let jitter = self.config.jitter_pct.abs();
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        (capped * factor).max(0.0) as i64
    }

    /// Durable upsert keyed by reservation_id. An existing entry keeps
    /// its `created_at`, bumps `attempt_count` by one, and refreshes
    /// `reason` and `next_attempt_at`. Reaching the attempt cap moves
    /// the entry to the terminal keyspace instead of rescheduling.
    pub async fn upsert(&self, req: DlqUpsert, now_ms: i64) -> CacheResult<UpsertOutcome> {
        let entry_key = self.entry_key(&req.reservation_id);
        let existing = match self.cache.get(&entry_key).await? {
            Some(raw) => serde_json::from_str::<DlqEntry>(&raw).ok(),
            None => None,
        };

        let (attempt_count, created_at_ms) = match &existing {
            Some(prev) => (prev.attempt_count + 1, prev.created_at_ms),
            None => (1, now_ms),
        };

        let mut entry = DlqEntry {
            reservation_id: req.reservation_id.clone(),
            tenant_id: req.tenant_id,
            actual_cost: req.actual_cost,
            trace_id: req.trace_id,
            reason: req.reason,
            response_status: req.response_status,
            attempt_count,
            next_attempt_at_ms: 0,
            created_at_ms,
        };

        debug_assert!(entry.attempt_count <= self.config.max_retries.max(1));

        if attempt_count >= self.config.max_retries {
            self.terminal_drop(&mut entry, now_ms).await?;
            return Ok(UpsertOutcome::TerminalDropped { attempt_count });
        }

        entry.next_attempt_at_ms = now_ms + self.backoff_ms(attempt_count);
        let raw = serde_json::to_string(&entry)
            .map_err(|e| crate::billing::cache::CacheError::Corrupt(e.to_string()))?;
        self.cache.set(&entry_key, &raw, None).await?;
        self.cache
            .zadd(&self.schedule_key(), &req.reservation_id, entry.next_attempt_at_ms)
            .await?;

        metrics::increment_counter!("dlq_upserts_total");
        Ok(UpsertOutcome::Scheduled {
            attempt_count,
            next_attempt_at_ms: entry.next_attempt_at_ms,
        })
    }

    /// Move an entry to the terminal keyspace: write the final payload
    /// into the active key, RENAME it into the terminal key (the
    /// atomic step), then clear the schedule member and claim lock.
    /// All audit fields are preserved, and the drop is journalled.
    async fn terminal_drop(&self, entry: &mut DlqEntry, now_ms: i64) -> CacheResult<()> {
        let rid = entry.reservation_id.clone();
        entry.next_attempt_at_ms = 0;
        let raw = serde_json::to_string(&entry)
            .map_err(|e| crate::billing::cache::CacheError::Corrupt(e.to_string()))?;

        let entry_key = self.entry_key(&rid);
        let terminal_key = self.terminal_key(&rid);
        self.cache.set(&entry_key, &raw, None).await?;
        self.cache.rename(&entry_key, &terminal_key).await?;
        self.cache.zrem(&self.schedule_key(), &rid).await?;
        self.cache.del(&self.lock_key(&rid)).await?;

        if let Err(e) = self.wal.append(
            WAL_NAMESPACE_DLQ,
            "terminal_drop",
            &rid,
            serde_json::json!({
                "entry": entry,
                "dropped_at_ms": now_ms,
            }),
        ) {
            error!(reservation_id = %rid, error = %e, "failed to journal dlq terminal drop");
        }

        metrics::increment_counter!("dlq_terminal_drops_total");
        error!(
            reservation_id = %rid,
            tenant_id = %entry.tenant_id,
            attempts = entry.attempt_count,
            reason = %entry.reason,
            "dlq entry exhausted retries; moved to terminal keyspace"
        );
        Ok(())
    }

    /// Up to `limit` entries whose `next_attempt_at <= now`. Schedule
    /// members without a payload are orphans: the member is removed,
    /// a warning logged, and no work returned for it.
    pub async fn ready(&self, now_ms: i64, limit: usize) -> CacheResult<Vec<DlqEntry>> {
        let members = self
            .cache
            .zrangebyscore(&self.schedule_key(), now_ms, limit)
            .await?;
        let mut out = Vec::with_capacity(members.len());
        for rid in members {
            match self.cache.get(&self.entry_key(&rid)).await? {
                Some(raw) => match serde_json::from_str::<DlqEntry>(&raw) {
                    Ok(entry) => out.push(entry),
                    Err(e) => {
                        warn!(reservation_id = %rid, error = %e, "undecodable dlq payload; removing from schedule");
                        self.cache.zrem(&self.schedule_key(), &rid).await?;
                    }
                },
                None => {
                    warn!(reservation_id = %rid, "orphaned dlq schedule member; repairing");
                    metrics::increment_counter!("dlq_orphans_repaired_total");
                    self.cache.zrem(&self.schedule_key(), &rid).await?;
                }
            }
        }
        Ok(out)
    }

    /// Atomic claim. Exactly one concurrent replayer wins; losers must
    /// skip all mutation for this entry.
    pub async fn claim(&self, reservation_id: &str) -> CacheResult<bool> {
        self.cache
            .set_nx(&self.lock_key(reservation_id), "1", Some(self.config.claim_ttl))
            .await
    }

    pub async fn release_claim(&self, reservation_id: &str) -> CacheResult<()> {
        self.cache.del(&self.lock_key(reservation_id)).await?;
        Ok(())
    }

    /// Successful replay: remove the entry, its schedule member, and
    /// the claim lock.
    pub async fn ack_success(&self, reservation_id: &str) -> CacheResult<()> {
        self.cache.del(&self.entry_key(reservation_id)).await?;
        self.cache.zrem(&self.schedule_key(), reservation_id).await?;
        self.cache.del(&self.lock_key(reservation_id)).await?;
        metrics::increment_counter!("dlq_replays_succeeded_total");
        Ok(())
    }

    pub async fn pending_count(&self) -> CacheResult<u64> {
        self.cache.zcard(&self.schedule_key()).await
    }

    /// Terminal archive lookup (audit).
    pub async fn terminal_entry(&self, reservation_id: &str) -> CacheResult<Option<DlqEntry>> {
        match self.cache.get(&self.terminal_key(reservation_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Active entry lookup (tests and operator introspection).
    pub async fn active_entry(&self, reservation_id: &str) -> CacheResult<Option<DlqEntry>> {
        match self.cache.get(&self.entry_key(reservation_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
