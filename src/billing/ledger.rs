//! Double-Entry Ledger Projection
//!
//! The WAL is the authoritative store; this module is the in-memory
//! projection rebuilt at boot by replaying it. Appends enforce the
//! zero-sum invariant and deduplicate on
//! (billing_entry_id, event_type, wal_offset), which makes replay
//! idempotent.

use crate::billing::journal::{AccountId, EventType, JournalEntry};
use crate::billing::money::MicroUsd;
use crate::billing::wal::{WalError, WalSink};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub const WAL_NAMESPACE_LEDGER: &str = "ledger";

/// Contract violations. These are bugs, never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    ZeroSumViolated {
        billing_entry_id: String,
        sum: MicroUsd,
    },
    BadPostingCount {
        billing_entry_id: String,
        count: usize,
    },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::ZeroSumViolated { billing_entry_id, sum } => write!(
                f,
                "journal entry {} postings sum to {} (must be 0)",
                billing_entry_id, sum
            ),
            LedgerError::BadPostingCount { billing_entry_id, count } => write!(
                f,
                "journal entry {} has {} postings (need at least 2)",
                billing_entry_id, count
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Applied,
    /// Replay of an already-projected entry; a no-op.
    Duplicate,
}

// =============================================================================
// PROJECTION
// =============================================================================

/// Pure in-memory projection of the journal.
#[derive(Default)]
pub struct Ledger {
    entries: Vec<JournalEntry>,
    seen: HashSet<(String, EventType, u64)>,
    balances: HashMap<AccountId, MicroUsd>,
    by_entry_id: HashMap<String, Vec<usize>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply one entry. Duplicates (per J2) are no-ops.
    pub fn append_entry(&mut self, entry: JournalEntry) -> Result<AppendOutcome, LedgerError> {
        if entry.postings.len() < 2 {
            return Err(LedgerError::BadPostingCount {
                billing_entry_id: entry.billing_entry_id.clone(),
                count: entry.postings.len(),
            });
        }
        let sum = entry.posting_sum();
        if !sum.is_zero() {
            return Err(LedgerError::ZeroSumViolated {
                billing_entry_id: entry.billing_entry_id.clone(),
                sum,
            });
        }
        if !self.seen.insert(entry.dedupe_key()) {
            return Ok(AppendOutcome::Duplicate);
        }

        for posting in &entry.postings {
            let balance = self
                .balances
                .entry(posting.account.clone())
                .or_insert_with(MicroUsd::zero);
            *balance += posting.delta.clone();
        }
        self.by_entry_id
            .entry(entry.billing_entry_id.clone())
            .or_default()
            .push(self.entries.len());
        self.entries.push(entry);
        Ok(AppendOutcome::Applied)
    }

    /// Sum of all posting deltas for the account, folded over the
    /// full journal. This is the authoritative derivation; `balance`
    /// is the cached fast path kept in lockstep by `append_entry`.
    pub fn derive_balance(&self, account: &AccountId) -> MicroUsd {
        let mut sum = MicroUsd::zero();
        for entry in &self.entries {
            for posting in &entry.postings {
                if &posting.account == account {
                    sum += posting.delta.clone();
                }
            }
        }
        sum
    }

    /// Authoritative balances for every account that ever appeared.
    pub fn derive_all_balances(&self) -> HashMap<AccountId, MicroUsd> {
        let mut out: HashMap<AccountId, MicroUsd> = HashMap::new();
        for entry in &self.entries {
            for posting in &entry.postings {
                let balance = out
                    .entry(posting.account.clone())
                    .or_insert_with(MicroUsd::zero);
                *balance += posting.delta.clone();
            }
        }
        out
    }

    /// Cached balance (kept in lockstep with appends).
    pub fn balance(&self, account: &AccountId) -> MicroUsd {
        self.balances
            .get(account)
            .cloned()
            .unwrap_or_else(MicroUsd::zero)
    }

    /// All entries for a billing entry id, in append order.
    pub fn entries_for(&self, billing_entry_id: &str) -> Vec<&JournalEntry> {
        self.by_entry_id
            .get(billing_entry_id)
            .map(|indices| indices.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// WAL-BACKED JOURNAL STORE
// =============================================================================

/// The journal's write path: append to the WAL first, then project.
/// Shared across the reserve engine, credit notes, and the
/// reconciliation job.
pub struct JournalStore {
    wal: Arc<dyn WalSink>,
    ledger: Mutex<Ledger>,
}

#[derive(Debug)]
pub enum JournalError {
    Ledger(LedgerError),
    Wal(WalError),
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::Ledger(e) => write!(f, "{}", e),
            JournalError::Wal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<LedgerError> for JournalError {
    fn from(e: LedgerError) -> Self {
        JournalError::Ledger(e)
    }
}

impl From<WalError> for JournalError {
    fn from(e: WalError) -> Self {
        JournalError::Wal(e)
    }
}

impl JournalStore {
    /// Open over a WAL sink and rebuild the projection by replay.
    pub fn open(wal: Arc<dyn WalSink>) -> Result<Self, JournalError> {
        let store = JournalStore {
            wal,
            ledger: Mutex::new(Ledger::new()),
        };
        store.rebuild()?;
        Ok(store)
    }

    fn rebuild(&self) -> Result<(), JournalError> {
        let mut ledger = self.ledger.lock();
        let mut applied = 0u64;
        let mut skipped = 0u64;
        self.wal.replay(&mut |record| {
            if record.namespace != WAL_NAMESPACE_LEDGER {
                return;
            }
            let mut entry: JournalEntry = match serde_json::from_value(record.payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "skipping undecodable ledger wal record");
                    skipped += 1;
                    return;
                }
            };
            entry.wal_offset = record.offset;
            match ledger.append_entry(entry) {
                Ok(AppendOutcome::Applied) => applied += 1,
                Ok(AppendOutcome::Duplicate) => skipped += 1,
                Err(e) => {
                    // A persisted entry that fails validation is a bug
                    // in the writer; it is surfaced loudly but replay
                    // continues so the rest of the journal projects.
                    warn!(offset = record.offset, error = %e, "invalid ledger entry in wal");
                    skipped += 1;
                }
            }
        })?;
        info!(applied = applied, skipped = skipped, "ledger projection rebuilt");
        Ok(())
    }

    /// Validate, persist, and project one entry. The WAL offset
    /// assigned on append is recorded into the projected entry.
    pub fn append(&self, mut entry: JournalEntry) -> Result<JournalEntry, JournalError> {
        // Validate before touching the WAL so contract violations
        // never persist.
        if entry.postings.len() < 2 {
            return Err(LedgerError::BadPostingCount {
                billing_entry_id: entry.billing_entry_id.clone(),
                count: entry.postings.len(),
            }
            .into());
        }
        if !entry.posting_sum().is_zero() {
            return Err(LedgerError::ZeroSumViolated {
                billing_entry_id: entry.billing_entry_id.clone(),
                sum: entry.posting_sum(),
            }
            .into());
        }

        let payload = serde_json::to_value(&entry).map_err(WalError::from)?;
        let offset = self.wal.append(
            WAL_NAMESPACE_LEDGER,
            entry.event_type.as_str(),
            &entry.billing_entry_id,
            payload,
        )?;
        entry.wal_offset = offset;
        self.ledger.lock().append_entry(entry.clone())?;
        Ok(entry)
    }

    pub fn balance(&self, account: &AccountId) -> MicroUsd {
        self.ledger.lock().balance(account)
    }

    pub fn derive_balance(&self, account: &AccountId) -> MicroUsd {
        self.ledger.lock().derive_balance(account)
    }

    pub fn derive_all_balances(&self) -> HashMap<AccountId, MicroUsd> {
        self.ledger.lock().derive_all_balances()
    }

    pub fn entries_for(&self, billing_entry_id: &str) -> Vec<JournalEntry> {
        self.ledger
            .lock()
            .entries_for(billing_entry_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.ledger.lock().len()
    }

    pub fn wal(&self) -> &Arc<dyn WalSink> {
        &self.wal
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::journal::EntryDraft;
    use crate::billing::wal::MemoryWal;

    fn draft(id: &str) -> EntryDraft {
        EntryDraft::new(id, "trace", 1_700_000_000_000)
    }

    #[test]
    fn test_append_and_balances() {
        let mut ledger = Ledger::new();
        let mint = draft("m1").credit_mint("u1", &MicroUsd::from_i64(100_000));
        ledger.append_entry(mint).unwrap();

        assert_eq!(
            ledger.balance(&AccountId::user_available("u1")),
            MicroUsd::from_i64(100_000)
        );
        assert_eq!(
            ledger.balance(&AccountId::treasury_usdc_received()),
            MicroUsd::from_i64(-100_000)
        );
        assert_eq!(
            ledger.derive_balance(&AccountId::user_available("u1")),
            ledger.balance(&AccountId::user_available("u1"))
        );
    }

    #[test]
    fn test_zero_sum_rejected() {
        let mut ledger = Ledger::new();
        let mut entry = draft("bad").billing_reserve("u1", &MicroUsd::from_i64(100));
        entry.postings[0].delta = MicroUsd::from_i64(-99);
        let err = ledger.append_entry(entry).unwrap_err();
        assert!(matches!(err, LedgerError::ZeroSumViolated { .. }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_bad_posting_count_rejected() {
        let mut ledger = Ledger::new();
        let mut entry = draft("bad").billing_reserve("u1", &MicroUsd::from_i64(100));
        entry.postings.truncate(1);
        let err = ledger.append_entry(entry).unwrap_err();
        assert!(matches!(err, LedgerError::BadPostingCount { count: 1, .. }));
    }

    #[test]
    fn test_duplicate_replay_is_noop() {
        let mut ledger = Ledger::new();
        let mut entry = draft("r1").billing_reserve("u1", &MicroUsd::from_i64(100));
        entry.wal_offset = 7;
        assert_eq!(ledger.append_entry(entry.clone()).unwrap(), AppendOutcome::Applied);
        assert_eq!(ledger.append_entry(entry).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(
            ledger.balance(&AccountId::user_held("u1")),
            MicroUsd::from_i64(100)
        );
    }

    #[test]
    fn test_entries_for_ordered() {
        let mut ledger = Ledger::new();
        let mut reserve = draft("r1").billing_reserve("u1", &MicroUsd::from_i64(100));
        reserve.wal_offset = 1;
        let mut commit = draft("r1").billing_commit("u1", &MicroUsd::from_i64(100), &MicroUsd::from_i64(30));
        commit.wal_offset = 2;
        ledger.append_entry(reserve).unwrap();
        ledger.append_entry(commit).unwrap();

        let entries = ledger.entries_for("r1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, EventType::BillingReserve);
        assert_eq!(entries[1].event_type, EventType::BillingCommit);
    }

    #[test]
    fn test_store_replay_yields_identical_projection() {
        let wal = Arc::new(MemoryWal::new());
        let store = JournalStore::open(wal.clone() as Arc<dyn WalSink>).unwrap();

        store
            .append(draft("m1").credit_mint("u1", &MicroUsd::from_i64(100_000)))
            .unwrap();
        store
            .append(draft("r1").billing_reserve("u1", &MicroUsd::from_i64(40_000)))
            .unwrap();
        store
            .append(draft("r1").billing_commit("u1", &MicroUsd::from_i64(40_000), &MicroUsd::from_i64(300)))
            .unwrap();

        let before = store.derive_all_balances();

        // Fresh projection over the same WAL.
        let rebuilt = JournalStore::open(wal as Arc<dyn WalSink>).unwrap();
        let after = rebuilt.derive_all_balances();
        assert_eq!(before, after);
        assert_eq!(rebuilt.entry_count(), 3);

        // Double replay cannot double-apply.
        let again = JournalStore::open(rebuilt.wal().clone()).unwrap();
        assert_eq!(again.entry_count(), 3);
        assert_eq!(
            again.balance(&AccountId::system_revenue()),
            MicroUsd::from_i64(300)
        );
        assert_eq!(
            again.balance(&AccountId::user_available("u1")),
            MicroUsd::from_i64(100_000 - 300)
        );
        assert_eq!(again.balance(&AccountId::user_held("u1")), MicroUsd::zero());
    }
}
