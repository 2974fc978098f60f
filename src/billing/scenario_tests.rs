//! End-to-end billing scenarios: overpayment credit notes, bounded
//! DLQ retry, and reconciliation headroom exhaustion.

use crate::billing::cache::{Cache, MemoryCache};
use crate::billing::credit_notes::{X402Config, X402Gateway};
use crate::billing::dlq::{DlqConfig, DlqStore};
use crate::billing::journal::{AccountId, EntryDraft};
use crate::billing::ledger::JournalStore;
use crate::billing::money::{BasisPoints, MicroUsd};
use crate::billing::reconcile::{
    AuthorityError, BudgetAuthority, BudgetSnapshot, ReconcileClient, ReconcileConfig,
    ReconcileStatus,
};
use crate::billing::reserve::{
    balance_key, FinalizeOutcome, FinalizeRequest, ReserveConfig, ReserveEngine, ReserveOutcome,
};
use crate::billing::wal::{MemoryWal, WalSink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Overpayment: reserve $0.10, stream costs 300 micro-USD, commit,
/// and a credit note covers the next call's quote in full.
#[tokio::test]
async fn test_overpayment_credit_note_flow() {
    let cache = Arc::new(MemoryCache::new());
    let wal: Arc<dyn WalSink> = Arc::new(MemoryWal::new());
    let journal = Arc::new(JournalStore::open(wal.clone()).unwrap());
    let dlq = Arc::new(DlqStore::new(cache.clone(), wal, DlqConfig::default()));
    let engine = ReserveEngine::new(
        cache.clone(),
        journal.clone(),
        dlq,
        ReserveConfig::default(),
    );
    let x402 = X402Gateway::new(
        cache.clone(),
        journal.clone(),
        b"secret".to_vec(),
        X402Config::default(),
    );

    // Fund the wallet with $1 and reserve $0.10.
    let fund = MicroUsd::from_i64(1_000_000);
    cache
        .set(
            &balance_key(&AccountId::user_available("w1")),
            &fund.to_wire(),
            None,
        )
        .await
        .unwrap();
    journal
        .append(EntryDraft::new("mint-w1", "t", 0).credit_mint("w1", &fund))
        .unwrap();

    let quote = MicroUsd::from_i64(100_000);
    let rid = match engine.reserve("w1", "cheap", &quote, "trace", 0).await.unwrap() {
        ReserveOutcome::Reserved { reservation_id, .. } => reservation_id,
        other => panic!("{:?}", other),
    };

    // 30 output tokens at $10/M output => 300 micro-USD actual.
    let actual = MicroUsd::from_i64(300);
    let outcome = engine
        .finalize(
            FinalizeRequest {
                reservation_id: rid.clone(),
                tenant_id: "w1".to_string(),
                actual_cost: actual.clone(),
                trace_id: "trace".to_string(),
                response_status: None,
            },
            10,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, FinalizeOutcome::Finalized { .. }));

    // held drops by the estimate, revenue gains the actual, available
    // gets the overage back.
    assert_eq!(
        journal.derive_balance(&AccountId::user_held("w1")),
        MicroUsd::zero()
    );
    assert_eq!(
        journal.derive_balance(&AccountId::system_revenue()),
        actual
    );
    assert_eq!(
        journal.derive_balance(&AccountId::user_available("w1")),
        MicroUsd::from_i64(1_000_000 - 300)
    );

    // Goodwill note for the quoted-vs-actual delta, topped up by a
    // prior 300 note, covers the next call's 100000 quote exactly.
    x402.mint_credit_note("w1", &MicroUsd::from_i64(300), "goodwill", "t", 20)
        .await
        .unwrap();
    x402.mint_credit_note(
        "w1",
        &(quote.clone() - actual.clone()),
        "quoted_vs_actual_delta",
        "t",
        30,
    )
    .await
    .unwrap();

    let application = x402
        .apply_credit_notes("w1", &MicroUsd::from_i64(100_000))
        .await
        .unwrap();
    assert_eq!(application.reduced, MicroUsd::zero());
    assert_eq!(application.used, MicroUsd::from_i64(100_000));
    assert_eq!(application.remaining, MicroUsd::zero());
}

/// Bounded retry: the billing cache is degraded, the DLQ (separate
/// store) absorbs three failing finalizes, and the third moves the
/// entry to the terminal keyspace with schedule and lock cleared.
#[tokio::test]
async fn test_dlq_bounded_retry_end_to_end() {
    let billing_cache = Arc::new(MemoryCache::new());
    let dlq_cache = Arc::new(MemoryCache::new());
    let wal: Arc<dyn WalSink> = Arc::new(MemoryWal::new());
    let journal = Arc::new(JournalStore::open(wal.clone()).unwrap());
    let dlq = Arc::new(DlqStore::new(
        dlq_cache.clone(),
        wal,
        DlqConfig {
            max_retries: 3,
            jitter_pct: 0.0,
            ..Default::default()
        },
    ));
    let engine = ReserveEngine::new(
        billing_cache.clone(),
        journal.clone(),
        dlq.clone(),
        ReserveConfig::default(),
    );

    // Fund + reserve while the cache is up.
    billing_cache
        .set(&balance_key(&AccountId::user_available("u1")), "10000", None)
        .await
        .unwrap();
    journal
        .append(EntryDraft::new("mint-u1", "t", 0).credit_mint("u1", &MicroUsd::from_i64(10_000)))
        .unwrap();
    let rid = match engine
        .reserve("u1", "cheap", &MicroUsd::from_i64(5_000), "trace", 0)
        .await
        .unwrap()
    {
        ReserveOutcome::Reserved { reservation_id, .. } => reservation_id,
        other => panic!("{:?}", other),
    };

    // Billing cache goes down; every finalize defers to the DLQ.
    billing_cache.set_healthy(false);
    let req = || FinalizeRequest {
        reservation_id: rid.clone(),
        tenant_id: "u1".to_string(),
        actual_cost: MicroUsd::from_i64(1_234),
        trace_id: "trace".to_string(),
        response_status: Some(503),
    };

    for attempt in 1..=2u32 {
        let outcome = engine.finalize(req(), attempt as i64 * 1_000).await.unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Dlq { .. }), "attempt {}", attempt);
        let entry = dlq.active_entry(&rid).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, attempt);
    }

    // Third failure hits the cap.
    let outcome = engine.finalize(req(), 3_000).await.unwrap();
    assert!(matches!(outcome, FinalizeOutcome::Dlq { .. }));

    // Entry moved to the terminal keyspace...
    assert!(dlq.active_entry(&rid).await.unwrap().is_none());
    let terminal = dlq.terminal_entry(&rid).await.unwrap().unwrap();
    assert_eq!(terminal.attempt_count, 3);
    assert_eq!(terminal.actual_cost, MicroUsd::from_i64(1_234));

    // ...absent from the schedule, and the claim lock is gone.
    assert_eq!(dlq.pending_count().await.unwrap(), 0);
    assert!(dlq_cache
        .get(&format!("dlq:lock:{}", rid))
        .await
        .unwrap()
        .is_none());
}

struct FixedAuthority {
    committed: MicroUsd,
    limit: MicroUsd,
}

#[async_trait]
impl BudgetAuthority for FixedAuthority {
    async fn fetch_budget(&self, _tenant: &str) -> Result<BudgetSnapshot, AuthorityError> {
        Ok(BudgetSnapshot {
            committed_micro: self.committed.clone(),
            reserved_micro: MicroUsd::zero(),
            limit_micro: self.limit.clone(),
            window_start: 0,
            window_end: 86_400_000,
        })
    }
}

/// Reconciliation headroom: synced at small drift, FAIL_OPEN on a
/// spend spike, headroom drains to FAIL_CLOSED, and the gate stays
/// shut until a clean sync.
#[tokio::test]
async fn test_reconciliation_headroom_exhaustion() {
    let config = ReconcileConfig {
        configured_threshold: MicroUsd::from_i64(1_000),
        headroom_percent: BasisPoints::new(1_000).unwrap(), // 10%
        headroom_abs_cap: MicroUsd::from_i64(10_000_000),
        fail_open_max_duration: Duration::from_secs(600),
        ..Default::default()
    };
    let authority = Arc::new(FixedAuthority {
        committed: MicroUsd::from_i64(1_000),
        limit: MicroUsd::from_i64(10_000_000),
    });
    let client = ReconcileClient::new("t1", authority, config);

    // committed=1000, local=500 -> drift 500 <= 1000 -> SYNCED.
    client.record_local_spend(&MicroUsd::from_i64(500));
    client.poll_once_at(0).await;
    assert_eq!(client.snapshot().status, ReconcileStatus::Synced);

    // Spike local spend to 5000: drift 4000 > threshold -> FAIL_OPEN
    // with headroom min(10% of 10M, cap) = 1M.
    client.record_local_spend(&MicroUsd::from_i64(4_500));
    client.poll_once_at(1_000).await;
    let state = client.snapshot();
    assert_eq!(state.status, ReconcileStatus::FailOpen);
    assert_eq!(
        state.fail_open_headroom_remaining,
        MicroUsd::from_i64(1_000_000)
    );

    // Drain the headroom; it only ever decreases.
    let mut previous = state.fail_open_headroom_remaining;
    while client.should_allow_request_at(2_000) {
        client.record_local_spend(&MicroUsd::from_i64(250_000));
        let remaining = client.snapshot().fail_open_headroom_remaining;
        assert!(remaining <= previous);
        previous = remaining;
    }
    assert_eq!(client.snapshot().status, ReconcileStatus::FailClosed);
    assert!(!client.should_allow_request_at(3_000));

    // Still closed after another out-of-threshold poll.
    client.poll_once_at(4_000).await;
    assert!(!client.should_allow_request_at(5_000));
}
