//! DLQ Replayer
//!
//! Background worker that drains due DLQ entries back through the
//! finalize path and sweeps expired reservations. Claims make each
//! entry single-writer; a failed replay re-upserts (bounded by the
//! DLQ attempt cap), a successful or idempotent one acks.

use crate::billing::dlq::{DlqEntry, DlqStore};
use crate::billing::reserve::{FinalizeOutcome, FinalizeRequest, ReserveEngine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub interval: Duration,
    pub batch_limit: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            interval: Duration::from_secs(15),
            batch_limit: 64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub expired_released: u64,
    pub replayed: u64,
    pub requeued: u64,
    pub unresolvable: u64,
    pub skipped_contended: u64,
}

pub struct DlqReplayer {
    dlq: Arc<DlqStore>,
    engine: Arc<ReserveEngine>,
    config: ReplayConfig,
}

impl DlqReplayer {
    pub fn new(dlq: Arc<DlqStore>, engine: Arc<ReserveEngine>, config: ReplayConfig) -> Self {
        DlqReplayer {
            dlq,
            engine,
            config,
        }
    }

    /// One drain pass. Called from the loop and directly from tests.
    pub async fn run_once(&self, now_ms: i64) -> ReplayStats {
        let mut stats = ReplayStats::default();

        match self.engine.expire_due(now_ms, self.config.batch_limit).await {
            Ok(released) => stats.expired_released = released,
            Err(e) => error!(error = %e, "reserve expiry sweep failed"),
        }

        let due = match self.dlq.ready(now_ms, self.config.batch_limit).await {
            Ok(due) => due,
            Err(e) => {
                debug!(error = %e, "dlq not readable this pass");
                return stats;
            }
        };

        for entry in due {
            match self.dlq.claim(&entry.reservation_id).await {
                Ok(true) => {}
                Ok(false) => {
                    stats.skipped_contended += 1;
                    continue;
                }
                Err(e) => {
                    debug!(reservation_id = %entry.reservation_id, error = %e, "claim failed");
                    continue;
                }
            }
            self.replay_one(entry, now_ms, &mut stats).await;
        }

        if stats != ReplayStats::default() {
            info!(
                expired_released = stats.expired_released,
                replayed = stats.replayed,
                requeued = stats.requeued,
                unresolvable = stats.unresolvable,
                "dlq replay pass complete"
            );
        }
        stats
    }

    async fn replay_one(&self, entry: DlqEntry, now_ms: i64, stats: &mut ReplayStats) {
        let rid = entry.reservation_id.clone();
        let req = FinalizeRequest {
            reservation_id: entry.reservation_id,
            tenant_id: entry.tenant_id,
            actual_cost: entry.actual_cost,
            trace_id: entry.trace_id,
            response_status: entry.response_status,
        };

        match self.engine.finalize(req, now_ms).await {
            Ok(FinalizeOutcome::Finalized { .. }) | Ok(FinalizeOutcome::Idempotent) => {
                if let Err(e) = self.dlq.ack_success(&rid).await {
                    warn!(reservation_id = %rid, error = %e, "replayed but ack failed; claim ttl will retry");
                }
                stats.replayed += 1;
            }
            Ok(FinalizeOutcome::NotFound) => {
                // No reservation and no marker: nothing finalizable
                // remains. The expiry sweep owns any stuck hold.
                warn!(reservation_id = %rid, "dlq entry references an unknown reservation; dropping");
                metrics::increment_counter!("dlq_unresolvable_total");
                let _ = self.dlq.ack_success(&rid).await;
                stats.unresolvable += 1;
            }
            Ok(FinalizeOutcome::Dlq { reason }) => {
                // finalize re-upserted with a bumped attempt count.
                debug!(reservation_id = %rid, reason = %reason, "replay failed; requeued");
                let _ = self.dlq.release_claim(&rid).await;
                stats.requeued += 1;
            }
            Err(e) => {
                error!(reservation_id = %rid, error = %e, "replay hit a contract error");
                let _ = self.dlq.release_claim(&rid).await;
            }
        }
    }

    /// Long-running loop. Spawned at boot.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once(Utc::now().timestamp_millis()).await;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::cache::{Cache, MemoryCache};
    use crate::billing::dlq::{DlqConfig, DlqUpsert};
    use crate::billing::journal::AccountId;
    use crate::billing::ledger::JournalStore;
    use crate::billing::money::MicroUsd;
    use crate::billing::reserve::{balance_key, ReserveConfig, ReserveOutcome};
    use crate::billing::wal::{MemoryWal, WalSink};

    struct Rig {
        replayer: DlqReplayer,
        engine: Arc<ReserveEngine>,
        dlq: Arc<DlqStore>,
        cache: Arc<MemoryCache>,
    }

    fn rig(max_retries: u32) -> Rig {
        let cache = Arc::new(MemoryCache::new());
        let wal: Arc<dyn WalSink> = Arc::new(MemoryWal::new());
        let journal = Arc::new(JournalStore::open(wal.clone()).unwrap());
        let dlq = Arc::new(DlqStore::new(
            cache.clone(),
            wal,
            DlqConfig {
                max_retries,
                jitter_pct: 0.0,
                ..Default::default()
            },
        ));
        let engine = Arc::new(ReserveEngine::new(
            cache.clone(),
            journal,
            dlq.clone(),
            ReserveConfig::default(),
        ));
        let replayer = DlqReplayer::new(dlq.clone(), engine.clone(), ReplayConfig::default());
        Rig {
            replayer,
            engine,
            dlq,
            cache,
        }
    }

    #[tokio::test]
    async fn test_replay_finalizes_deferred_commit() {
        let rig = rig(5);
        let tenant_avail = balance_key(&AccountId::user_available("u1"));
        rig.cache.set(&tenant_avail, "1000", None).await.unwrap();
        rig.engine
            .journal()
            .append(
                crate::billing::journal::EntryDraft::new("mint-u1", "t", 0)
                    .credit_mint("u1", &MicroUsd::from_i64(1_000)),
            )
            .unwrap();

        let rid = match rig
            .engine
            .reserve("u1", "cheap", &MicroUsd::from_i64(500), "trace", 0)
            .await
            .unwrap()
        {
            ReserveOutcome::Reserved { reservation_id, .. } => reservation_id,
            other => panic!("{:?}", other),
        };

        // Provider blew up; the finalize was queued instead of applied.
        rig.dlq
            .upsert(
                DlqUpsert {
                    reservation_id: rid.clone(),
                    tenant_id: "u1".to_string(),
                    actual_cost: MicroUsd::from_i64(200),
                    trace_id: "trace".to_string(),
                    reason: "provider_503".to_string(),
                    response_status: Some(503),
                },
                0,
            )
            .await
            .unwrap();

        // First attempt is due at backoff; run past it.
        let stats = rig.replayer.run_once(10_000).await;
        assert_eq!(stats.replayed, 1);
        assert_eq!(rig.dlq.pending_count().await.unwrap(), 0);

        // The commit landed.
        assert_eq!(
            rig.cache
                .get(&balance_key(&AccountId::system_revenue()))
                .await
                .unwrap(),
            Some("200".to_string())
        );
        assert_eq!(
            rig.engine.journal().derive_balance(&AccountId::user_held("u1")),
            MicroUsd::zero()
        );
    }

    #[tokio::test]
    async fn test_contended_entries_skipped() {
        let rig = rig(5);
        rig.dlq
            .upsert(
                DlqUpsert {
                    reservation_id: "r1".to_string(),
                    tenant_id: "u1".to_string(),
                    actual_cost: MicroUsd::from_i64(1),
                    trace_id: "t".to_string(),
                    reason: "x".to_string(),
                    response_status: None,
                },
                0,
            )
            .await
            .unwrap();

        // Another replayer holds the claim.
        assert!(rig.dlq.claim("r1").await.unwrap());

        let stats = rig.replayer.run_once(60_000).await;
        assert_eq!(stats.skipped_contended, 1);
        assert_eq!(stats.replayed, 0);
        // Entry untouched.
        assert_eq!(rig.dlq.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_reservation_dropped() {
        let rig = rig(5);
        rig.dlq
            .upsert(
                DlqUpsert {
                    reservation_id: "ghost".to_string(),
                    tenant_id: "u1".to_string(),
                    actual_cost: MicroUsd::from_i64(1),
                    trace_id: "t".to_string(),
                    reason: "x".to_string(),
                    response_status: None,
                },
                0,
            )
            .await
            .unwrap();

        let stats = rig.replayer.run_once(60_000).await;
        assert_eq!(stats.unresolvable, 1);
        assert_eq!(rig.dlq.pending_count().await.unwrap(), 0);
    }
}
