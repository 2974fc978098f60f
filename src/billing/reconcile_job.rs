//! Nightly Balance Reconciliation
//!
//! Re-derives every account balance from the journal and overwrites
//! cache drift. Each divergence appends a reconciliation_correction
//! record to the WAL *before* the cache write, so the audit trail
//! always leads the projection. Corrections live in their own WAL
//! namespace: the ledger is already authoritative, so they document
//! the cache fix rather than re-posting into the ledger.
//!
//! Runs daily at 02:00 UTC as an in-process task.

use crate::billing::cache::Cache;
use crate::billing::ledger::JournalStore;
use crate::billing::money::MicroUsd;
use crate::billing::reserve::balance_key;
use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const WAL_NAMESPACE_RECONCILIATION: &str = "reconciliation";

/// Hour of day (UTC) the job fires.
const RUN_HOUR_UTC: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub reconciliation_run_id: String,
    pub accounts_checked: u64,
    pub divergences_found: u64,
    pub divergences_corrected: u64,
    pub total_rounding_drift: MicroUsd,
    pub drift_threshold_exceeded: bool,
    pub duration_ms: u64,
}

pub struct ReconcileJob {
    journal: Arc<JournalStore>,
    cache: Arc<dyn Cache>,
    /// Total-drift level that flags the summary for operator review.
    drift_alert_threshold: MicroUsd,
}

impl ReconcileJob {
    pub fn new(
        journal: Arc<JournalStore>,
        cache: Arc<dyn Cache>,
        drift_alert_threshold: MicroUsd,
    ) -> Self {
        ReconcileJob {
            journal,
            cache,
            drift_alert_threshold,
        }
    }

    /// One full sweep. Returns the emitted summary.
    pub async fn run_once(&self, now_ms: i64) -> ReconcileSummary {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let derived = self.journal.derive_all_balances();

        let mut accounts_checked = 0u64;
        let mut divergences_found = 0u64;
        let mut divergences_corrected = 0u64;
        let mut total_drift = MicroUsd::zero();

        for (account, derived_balance) in derived {
            accounts_checked += 1;
            let key = balance_key(&account);
            let cached_balance = match self.cache.get(&key).await {
                Ok(Some(raw)) => match MicroUsd::parse_canonical(&raw) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(account = %account, error = %e, "uninterpretable cached balance; treating as zero");
                        MicroUsd::zero()
                    }
                },
                Ok(None) => MicroUsd::zero(),
                Err(e) => {
                    warn!(account = %account, error = %e, "cache unreadable; skipping account this run");
                    continue;
                }
            };

            if cached_balance == derived_balance {
                continue;
            }
            divergences_found += 1;
            let delta = derived_balance.clone() - cached_balance.clone();
            total_drift += delta.abs();

            // Audit record first, then the overwrite.
            let payload = serde_json::json!({
                "account": account.as_str(),
                "derived_balance": derived_balance.to_wire(),
                "cached_balance": cached_balance.to_wire(),
                "delta": delta.to_wire(),
                "reconciliation_run_id": run_id,
                "timestamp": now_ms,
            });
            if let Err(e) = self.journal.wal().append(
                WAL_NAMESPACE_RECONCILIATION,
                "reconciliation_correction",
                account.as_str(),
                payload,
            ) {
                warn!(account = %account, error = %e, "correction audit append failed; not overwriting cache");
                continue;
            }

            match self.cache.set(&key, &derived_balance.to_wire(), None).await {
                Ok(()) => {
                    divergences_corrected += 1;
                    info!(
                        account = %account,
                        cached = %cached_balance,
                        derived = %derived_balance,
                        delta = %delta,
                        "corrected cached balance"
                    );
                }
                Err(e) => {
                    warn!(account = %account, error = %e, "cache overwrite failed");
                }
            }
        }

        let summary = ReconcileSummary {
            reconciliation_run_id: run_id.clone(),
            accounts_checked,
            divergences_found,
            divergences_corrected,
            total_rounding_drift: total_drift.clone(),
            drift_threshold_exceeded: total_drift > self.drift_alert_threshold,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if let Ok(payload) = serde_json::to_value(&summary) {
            if let Err(e) =
                self.journal
                    .wal()
                    .append(WAL_NAMESPACE_RECONCILIATION, "summary", &run_id, payload)
            {
                warn!(error = %e, "reconciliation summary append failed");
            }
        }

        metrics::counter!("reconciliation_divergences_total", summary.divergences_found);
        metrics::histogram!(
            "reconciliation_duration_ms",
            summary.duration_ms as f64
        );
        if summary.drift_threshold_exceeded {
            warn!(
                run_id = %run_id,
                total_drift = %summary.total_rounding_drift,
                "reconciliation drift exceeded alert threshold"
            );
        } else {
            info!(
                run_id = %run_id,
                accounts_checked = summary.accounts_checked,
                divergences_found = summary.divergences_found,
                divergences_corrected = summary.divergences_corrected,
                duration_ms = summary.duration_ms,
                "reconciliation run complete"
            );
        }
        summary
    }

    /// Sleep until the next 02:00 UTC, run, repeat.
    pub async fn run(self: Arc<Self>) {
        loop {
            let wait = Self::until_next_run();
            tokio::time::sleep(wait).await;
            self.run_once(Utc::now().timestamp_millis()).await;
        }
    }

    fn until_next_run() -> std::time::Duration {
        let now = Utc::now();
        let today_run = now.date_naive().and_time(
            NaiveTime::from_hms_opt(RUN_HOUR_UTC, 0, 0).unwrap_or_default(),
        );
        let next = if now.naive_utc() < today_run {
            today_run
        } else {
            today_run + ChronoDuration::days(1)
        };
        (next - now.naive_utc())
            .to_std()
            .unwrap_or_else(|_| std::time::Duration::from_secs(60))
    }
}

// =============================================================================
// TESTS
// =============================================================================
