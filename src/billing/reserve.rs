//! Reserve / Finalize Engine
//!
//! The billed-request hot path. A reserve is a scripted
//! compare-and-set that moves `max_cost` from available to held and
//! creates the reservation record; finalize commits (actual <=
//! ceiling), releases (actual = 0), or is deferred to the DLQ when
//! the failure is retryable.
//!
//! Ordering under partial failure: the journal (WAL) is written
//! before the cache projection. A finalize that journalled but could
//! not project leaves the cache stale, which the reconciliation job
//! corrects from the ledger; a finalize that could not even read the
//! reservation goes to the DLQ and never journals. Replays are
//! no-ops: at most one terminal transition per reservation exists.

use crate::billing::cache::{Cache, CacheError, ReserveScriptOutcome};
use crate::billing::dlq::{DlqStore, DlqUpsert};
use crate::billing::journal::{AccountId, EntryDraft, EventType, RoundingDirection};
use crate::billing::ledger::{JournalError, JournalStore};
use crate::billing::money::MicroUsd;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const RESERVATION_SCHEDULE_KEY: &str = "reservation:schedule";

/// Cache key for a ledger account's projected balance.
pub fn balance_key(account: &AccountId) -> String {
    format!("balance:{}:value", account)
}

#[derive(Debug, Clone)]
pub struct ReserveConfig {
    /// Auto-release horizon when finalize never arrives.
    pub reserve_ttl: Duration,
    /// TTL on the in-flight finalize claim.
    pub finalize_claim_ttl: Duration,
}

impl Default for ReserveConfig {
    fn default() -> Self {
        ReserveConfig {
            reserve_ttl: Duration::from_secs(10 * 60),
            finalize_claim_ttl: Duration::from_secs(30),
        }
    }
}

/// Reservation record cached under `reservation:{reservation_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub reservation_id: String,
    pub tenant_id: String,
    pub max_cost: MicroUsd,
    pub pool: String,
    pub trace_id: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Terminal disposition recorded under `reservation:{rid}:final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeDisposition {
    Committed,
    Released,
    Voided,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FinalMarker {
    disposition: FinalizeDisposition,
    actual_cost: MicroUsd,
    finalized_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved {
        reservation_id: String,
        max_cost: MicroUsd,
    },
    InsufficientFunds {
        available: MicroUsd,
    },
    /// Cache down: new reserves fail closed.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub reservation_id: String,
    pub tenant_id: String,
    pub actual_cost: MicroUsd,
    pub trace_id: String,
    pub response_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Finalized {
        disposition: FinalizeDisposition,
        actual_cost: MicroUsd,
    },
    /// Replay of an already-finalized reservation; a no-op.
    Idempotent,
    NotFound,
    /// Deferred into the DLQ with a retryable reason.
    Dlq { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoidOutcome {
    Voided { amount: MicroUsd },
    NotCommitted,
    AlreadyVoided,
    Unavailable,
}

pub struct ReserveEngine {
    cache: Arc<dyn Cache>,
    journal: Arc<JournalStore>,
    dlq: Arc<DlqStore>,
    config: ReserveConfig,
}

impl ReserveEngine {
    pub fn new(
        cache: Arc<dyn Cache>,
        journal: Arc<JournalStore>,
        dlq: Arc<DlqStore>,
        config: ReserveConfig,
    ) -> Self {
        ReserveEngine {
            cache,
            journal,
            dlq,
            config,
        }
    }

    pub fn journal(&self) -> &Arc<JournalStore> {
        &self.journal
    }

    pub fn dlq(&self) -> &Arc<DlqStore> {
        &self.dlq
    }

    fn reservation_key(rid: &str) -> String {
        format!("reservation:{}", rid)
    }

    fn final_key(rid: &str) -> String {
        format!("reservation:{}:final", rid)
    }

    fn finalizing_key(rid: &str) -> String {
        format!("reservation:{}:finalizing", rid)
    }

    // -------------------------------------------------------------------------
    // RESERVE
    // -------------------------------------------------------------------------

    /// Atomic reserve of `max_cost` against the tenant's available
    /// balance. Fails closed when the cache is unavailable.
    pub async fn reserve(
        &self,
        tenant_id: &str,
        pool: &str,
        max_cost: &MicroUsd,
        trace_id: &str,
        now_ms: i64,
    ) -> Result<ReserveOutcome, JournalError> {
        if !self.cache.is_healthy() {
            metrics::increment_counter!("reserve_total", "outcome" => "unavailable");
            return Ok(ReserveOutcome::Unavailable);
        }

        let reservation_id = Uuid::new_v4().to_string();
        let expires_at_ms = now_ms + self.config.reserve_ttl.as_millis() as i64;
        let record = ReservationRecord {
            reservation_id: reservation_id.clone(),
            tenant_id: tenant_id.to_string(),
            max_cost: max_cost.clone(),
            pool: pool.to_string(),
            trace_id: trace_id.to_string(),
            created_at_ms: now_ms,
            expires_at_ms,
        };
        let record_json = serde_json::to_string(&record)
            .map_err(crate::billing::wal::WalError::from)?;

        let available_key = balance_key(&AccountId::user_available(tenant_id));
        let held_key = balance_key(&AccountId::user_held(tenant_id));

        // The record key outlives the sweep horizon so the expiry
        // sweep, not the cache TTL, is what releases held funds.
        let script = self
            .cache
            .reserve_if_available(
                &available_key,
                &held_key,
                &Self::reservation_key(&reservation_id),
                &max_cost.to_wire(),
                &record_json,
                self.config.reserve_ttl * 2,
            )
            .await;

        match script {
            Ok(ReserveScriptOutcome::Reserved) => {}
            Ok(ReserveScriptOutcome::InsufficientFunds { available }) => {
                metrics::increment_counter!("reserve_total", "outcome" => "insufficient_funds");
                let available = MicroUsd::parse_canonical(&available)
                    .unwrap_or_else(|_| MicroUsd::zero());
                return Ok(ReserveOutcome::InsufficientFunds { available });
            }
            Ok(ReserveScriptOutcome::Conflict) => {
                error!(reservation_id = %reservation_id, "reservation id collision on reserve");
                metrics::increment_counter!("reserve_total", "outcome" => "conflict");
                return Ok(ReserveOutcome::Unavailable);
            }
            Err(CacheError::Unavailable) => {
                metrics::increment_counter!("reserve_total", "outcome" => "unavailable");
                return Ok(ReserveOutcome::Unavailable);
            }
            Err(CacheError::Corrupt(msg)) => {
                error!(tenant_id = tenant_id, error = %msg, "corrupt balance key during reserve");
                metrics::increment_counter!("reserve_total", "outcome" => "unavailable");
                return Ok(ReserveOutcome::Unavailable);
            }
        }

        // Expiry schedule, best effort: the sweep also repairs from
        // the ledger when a schedule write was lost.
        if let Err(e) = self
            .cache
            .zadd(RESERVATION_SCHEDULE_KEY, &reservation_id, expires_at_ms)
            .await
        {
            warn!(reservation_id = %reservation_id, error = %e, "failed to schedule reserve expiry");
        }

        let entry = EntryDraft::new(&reservation_id, trace_id, now_ms)
            .with_rounding(RoundingDirection::Ceil)
            .billing_reserve(tenant_id, max_cost);
        self.journal.append(entry)?;

        metrics::increment_counter!("reserve_total", "outcome" => "reserved");
        info!(
            reservation_id = %reservation_id,
            tenant_id = tenant_id,
            pool = pool,
            max_cost = %max_cost,
            "funds reserved"
        );
        Ok(ReserveOutcome::Reserved {
            reservation_id,
            max_cost: max_cost.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // FINALIZE
    // -------------------------------------------------------------------------

    /// Commit or release a reservation. Idempotent on replay; cache
    /// outages defer into the DLQ instead of failing the caller.
    pub async fn finalize(
        &self,
        req: FinalizeRequest,
        now_ms: i64,
    ) -> Result<FinalizeOutcome, JournalError> {
        let rid = req.reservation_id.clone();

        // Already finalized?
        match self.cache.get(&Self::final_key(&rid)).await {
            Ok(Some(_)) => {
                metrics::increment_counter!("finalize_total", "outcome" => "idempotent");
                return Ok(FinalizeOutcome::Idempotent);
            }
            Ok(None) => {}
            Err(_) => return Ok(self.defer_to_dlq(req, "cache_unavailable", now_ms).await),
        }

        // Exactly one finalizer proceeds per reservation.
        match self
            .cache
            .set_nx(&Self::finalizing_key(&rid), "1", Some(self.config.finalize_claim_ttl))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                metrics::increment_counter!("finalize_total", "outcome" => "idempotent");
                return Ok(FinalizeOutcome::Idempotent);
            }
            Err(_) => return Ok(self.defer_to_dlq(req, "cache_unavailable", now_ms).await),
        }

        let record = match self.cache.get(&Self::reservation_key(&rid)).await {
            Ok(Some(raw)) => match serde_json::from_str::<ReservationRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    error!(reservation_id = %rid, error = %e, "corrupt reservation record");
                    let _ = self.cache.del(&Self::finalizing_key(&rid)).await;
                    metrics::increment_counter!("finalize_total", "outcome" => "not_found");
                    return Ok(FinalizeOutcome::NotFound);
                }
            },
            Ok(None) => {
                let _ = self.cache.del(&Self::finalizing_key(&rid)).await;
                metrics::increment_counter!("finalize_total", "outcome" => "not_found");
                return Ok(FinalizeOutcome::NotFound);
            }
            Err(_) => {
                let _ = self.cache.del(&Self::finalizing_key(&rid)).await;
                return Ok(self.defer_to_dlq(req, "cache_unavailable", now_ms).await);
            }
        };

        let tenant = record.tenant_id.as_str();
        let max_cost = record.max_cost.clone();
        let actual = req.actual_cost.clone();

        if actual > max_cost {
            // Commit posting rules debit the shortfall from available;
            // flagged because the quote is supposed to be a ceiling.
            warn!(
                reservation_id = %rid,
                actual = %actual,
                max_cost = %max_cost,
                "actual cost exceeds reserve ceiling"
            );
        }

        let (disposition, entry, reason) = if actual.is_zero() {
            (
                FinalizeDisposition::Released,
                EntryDraft::new(&rid, &req.trace_id, now_ms).billing_release(tenant, &max_cost),
                None,
            )
        } else {
            (
                FinalizeDisposition::Committed,
                EntryDraft::new(&rid, &req.trace_id, now_ms).billing_commit(tenant, &max_cost, &actual),
                None,
            )
        };

        // WAL first: the journal is the authority.
        match self.journal.append(entry) {
            Ok(_) => {}
            Err(e) => {
                let _ = self.cache.del(&Self::finalizing_key(&rid)).await;
                return Err(e);
            }
        }

        self.project_finalize(&rid, tenant, &max_cost, &actual, disposition, reason, now_ms)
            .await;

        metrics::increment_counter!(
            "finalize_total",
            "outcome" => match disposition {
                FinalizeDisposition::Committed => "committed",
                FinalizeDisposition::Released => "released",
                FinalizeDisposition::Voided => "voided",
            }
        );
        info!(
            reservation_id = %rid,
            tenant_id = tenant,
            actual_cost = %actual,
            disposition = ?disposition,
            "reservation finalized"
        );
        Ok(FinalizeOutcome::Finalized {
            disposition,
            actual_cost: actual,
        })
    }

    /// Project a journalled finalize into the cache. Failures here are
    /// drift, not data loss: the reconciliation job re-derives from
    /// the ledger.
    async fn project_finalize(
        &self,
        rid: &str,
        tenant: &str,
        max_cost: &MicroUsd,
        actual: &MicroUsd,
        disposition: FinalizeDisposition,
        reason: Option<String>,
        now_ms: i64,
    ) {
        let marker = FinalMarker {
            disposition,
            actual_cost: actual.clone(),
            finalized_at_ms: now_ms,
            reason,
        };
        let marker_json = match serde_json::to_string(&marker) {
            Ok(j) => j,
            Err(e) => {
                error!(reservation_id = rid, error = %e, "unserializable finalize marker");
                return;
            }
        };
        if let Err(e) = self.cache.set(&Self::final_key(rid), &marker_json, None).await {
            warn!(reservation_id = rid, error = %e, "finalize marker write failed; reconciliation will correct");
        }

        let held = balance_key(&AccountId::user_held(tenant));
        let available = balance_key(&AccountId::user_available(tenant));
        let revenue = balance_key(&AccountId::system_revenue());
        let mut deltas: Vec<(String, String)> = vec![(held, (-max_cost.clone()).to_wire())];
        match disposition {
            FinalizeDisposition::Released => {
                deltas.push((available, max_cost.to_wire()));
            }
            FinalizeDisposition::Committed => {
                deltas.push((revenue, actual.to_wire()));
                let overage = max_cost.clone() - actual.clone();
                if !overage.is_zero() {
                    deltas.push((available, overage.to_wire()));
                }
            }
            FinalizeDisposition::Voided => {}
        }
        if let Err(e) = self.cache.apply_deltas(&deltas).await {
            warn!(reservation_id = rid, error = %e, "balance projection failed; reconciliation will correct");
        }

        let _ = self.cache.del(&Self::reservation_key(rid)).await;
        let _ = self.cache.del(&Self::finalizing_key(rid)).await;
        let _ = self.cache.zrem(RESERVATION_SCHEDULE_KEY, rid).await;
    }

    async fn defer_to_dlq(
        &self,
        req: FinalizeRequest,
        reason: &str,
        now_ms: i64,
    ) -> FinalizeOutcome {
        let upsert = DlqUpsert {
            reservation_id: req.reservation_id.clone(),
            tenant_id: req.tenant_id,
            actual_cost: req.actual_cost,
            trace_id: req.trace_id,
            reason: reason.to_string(),
            response_status: req.response_status,
        };
        match self.dlq.upsert(upsert, now_ms).await {
            Ok(_) => {}
            Err(e) => {
                // The DLQ shares the cache; when both are down the WAL
                // still records the deferral so recovery can re-derive.
                error!(
                    reservation_id = %req.reservation_id,
                    error = %e,
                    "dlq enqueue failed; journalling deferral for recovery"
                );
                let _ = self.journal.wal().append(
                    crate::billing::dlq::WAL_NAMESPACE_DLQ,
                    "enqueue_failed",
                    &req.reservation_id,
                    serde_json::json!({
                        "reason": reason,
                        "at_ms": now_ms,
                    }),
                );
            }
        }
        metrics::increment_counter!("finalize_total", "outcome" => "dlq");
        FinalizeOutcome::Dlq {
            reason: reason.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // VOID
    // -------------------------------------------------------------------------

    /// Reverse a committed reservation: revenue gives the actual cost
    /// back to the tenant's available balance.
    pub async fn void(
        &self,
        reservation_id: &str,
        trace_id: &str,
        now_ms: i64,
    ) -> Result<VoidOutcome, JournalError> {
        let marker = match self.cache.get(&Self::final_key(reservation_id)).await {
            Ok(Some(raw)) => serde_json::from_str::<FinalMarker>(&raw).ok(),
            Ok(None) => None,
            Err(_) => return Ok(VoidOutcome::Unavailable),
        };
        let Some(marker) = marker else {
            return Ok(VoidOutcome::NotCommitted);
        };
        match marker.disposition {
            FinalizeDisposition::Committed => {}
            FinalizeDisposition::Voided => return Ok(VoidOutcome::AlreadyVoided),
            FinalizeDisposition::Released => return Ok(VoidOutcome::NotCommitted),
        }

        // Single void per reservation.
        match self
            .cache
            .set_nx(
                &format!("reservation:{}:voiding", reservation_id),
                "1",
                Some(self.config.finalize_claim_ttl),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(VoidOutcome::AlreadyVoided),
            Err(_) => return Ok(VoidOutcome::Unavailable),
        }

        let amount = marker.actual_cost.clone();
        // The commit entry names the tenant; recover it from the
        // ledger rather than trusting the caller.
        let Some(tenant) = self.tenant_for(reservation_id) else {
            return Ok(VoidOutcome::NotCommitted);
        };

        let entry = EntryDraft::new(reservation_id, trace_id, now_ms).billing_void(&tenant, &amount);
        self.journal.append(entry)?;

        let updated = FinalMarker {
            disposition: FinalizeDisposition::Voided,
            actual_cost: amount.clone(),
            finalized_at_ms: now_ms,
            reason: marker.reason,
        };
        if let Ok(json) = serde_json::to_string(&updated) {
            let _ = self.cache.set(&Self::final_key(reservation_id), &json, None).await;
        }
        let deltas = vec![
            (
                balance_key(&AccountId::system_revenue()),
                (-amount.clone()).to_wire(),
            ),
            (
                balance_key(&AccountId::user_available(&tenant)),
                amount.to_wire(),
            ),
        ];
        if let Err(e) = self.cache.apply_deltas(&deltas).await {
            warn!(reservation_id = reservation_id, error = %e, "void projection failed; reconciliation will correct");
        }

        metrics::increment_counter!("finalize_total", "outcome" => "voided");
        Ok(VoidOutcome::Voided { amount })
    }

    /// Tenant recovery from the reserve entry's held posting.
    fn tenant_for(&self, reservation_id: &str) -> Option<String> {
        let entries = self.journal.entries_for(reservation_id);
        for entry in &entries {
            if entry.event_type == EventType::BillingReserve {
                for posting in &entry.postings {
                    if let Some(tenant) = posting
                        .account
                        .as_str()
                        .strip_prefix("user:")
                        .and_then(|s| s.strip_suffix(":held"))
                    {
                        return Some(tenant.to_string());
                    }
                }
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // EXPIRY SWEEP
    // -------------------------------------------------------------------------

    /// Release reservations whose TTL elapsed without a finalize.
    /// Journalled like an explicit release, with a reason.
    pub async fn expire_due(&self, now_ms: i64, limit: usize) -> Result<u64, JournalError> {
        let due = match self
            .cache
            .zrangebyscore(RESERVATION_SCHEDULE_KEY, now_ms, limit)
            .await
        {
            Ok(members) => members,
            Err(_) => return Ok(0),
        };

        let mut released = 0u64;
        for rid in due {
            // Finalized while scheduled: just clear the member.
            if let Ok(Some(_)) = self.cache.get(&Self::final_key(&rid)).await {
                let _ = self.cache.zrem(RESERVATION_SCHEDULE_KEY, &rid).await;
                continue;
            }

            let record = match self.cache.take(&Self::reservation_key(&rid)).await {
                Ok(Some(raw)) => serde_json::from_str::<ReservationRecord>(&raw).ok(),
                Ok(None) => None,
                Err(_) => continue,
            };

            let (tenant, amount) = match record {
                Some(record) => (record.tenant_id, record.max_cost),
                None => {
                    // Record evaporated (cache TTL); the reserve entry
                    // in the ledger still knows the hold.
                    match self.held_for(&rid) {
                        Some(pair) => pair,
                        None => {
                            let _ = self.cache.zrem(RESERVATION_SCHEDULE_KEY, &rid).await;
                            continue;
                        }
                    }
                }
            };

            let entry = EntryDraft::new(&rid, "reserve-expiry", now_ms).billing_release(&tenant, &amount);
            self.journal.append(entry)?;
            self.project_finalize(
                &rid,
                &tenant,
                &amount,
                &MicroUsd::zero(),
                FinalizeDisposition::Released,
                Some("reserve_expired".to_string()),
                now_ms,
            )
            .await;
            metrics::increment_counter!("reserve_expired_total");
            warn!(reservation_id = %rid, tenant_id = %tenant, amount = %amount, "reserve expired; held funds released");
            released += 1;
        }
        Ok(released)
    }

    /// (tenant, held amount) for an unfinalized reservation, derived
    /// from the ledger.
    fn held_for(&self, reservation_id: &str) -> Option<(String, MicroUsd)> {
        let entries = self.journal.entries_for(reservation_id);
        let mut reserve: Option<(String, MicroUsd)> = None;
        for entry in &entries {
            match entry.event_type {
                EventType::BillingReserve => {
                    for posting in &entry.postings {
                        if let Some(tenant) = posting
                            .account
                            .as_str()
                            .strip_prefix("user:")
                            .and_then(|s| s.strip_suffix(":held"))
                        {
                            reserve = Some((tenant.to_string(), posting.delta.clone()));
                        }
                    }
                }
                EventType::BillingCommit | EventType::BillingRelease => return None,
                _ => {}
            }
        }
        reserve
    }
}

// =============================================================================
// TESTS
// =============================================================================
