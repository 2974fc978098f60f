//! Billing Core
//!
//! The financial-correctness engine behind the gateway: a
//! double-entry ledger journalled to a write-ahead log, a Redis-shaped
//! cache projection, and the reserve/finalize machinery that charges
//! tenants for what a stream actually consumed.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────────────────────────┐
//!                 │              ReserveEngine                │
//!                 │  quote → reserve → execute → finalize     │
//!                 └───────────────────────────────────────────┘
//!                    │               │                 │
//!          ┌─────────┘               │                 └─────────┐
//!          ▼                         ▼                           ▼
//!   ┌─────────────┐          ┌──────────────┐            ┌─────────────┐
//!   │ JournalStore│          │    Cache     │            │  DlqStore   │
//!   │ (WAL-backed │          │ (balances,   │            │ (bounded    │
//!   │  ledger)    │          │  scripts)    │            │  retries)   │
//!   └──────┬──────┘          └──────────────┘            └──────┬──────┘
//!          │                         ▲                          │
//!          ▼                         │                          ▼
//!   ┌─────────────┐          ┌──────┴───────┐           ┌─────────────┐
//!   │   WalSink   │          │ ReconcileJob │           │ DlqReplayer │
//!   │ (append +   │─────────▶│ (re-derive,  │           │ (claim +    │
//!   │  replay)    │  replay  │  correct)    │           │  retry)     │
//!   └─────────────┘          └──────────────┘           └─────────────┘
//! ```
//!
//! # Authority Ordering
//!
//! The WAL is authoritative; the cache is a projection. Every
//! money-moving write journals first and projects second, so a crash
//! between the two leaves drift the reconciliation job repairs, never
//! a lost entry.

pub mod cache;
pub mod cost_tracker;
pub mod credit_notes;
pub mod dlq;
pub mod dlq_replay;
pub mod journal;
pub mod ledger;
pub mod money;
pub mod pricing;
pub mod reconcile;
pub mod reconcile_job;
pub mod reserve;
pub mod wal;

#[cfg(test)]
mod invariant_tests;
#[cfg(test)]
mod scenario_tests;

// Re-exports for convenience
pub use cache::{Cache, CacheError, MemoryCache};
pub use cost_tracker::{BillingMethod, CostResult, CostTracker};
pub use credit_notes::{CreditApplication, PaymentChallenge, X402Gateway};
pub use dlq::{DlqConfig, DlqEntry, DlqStore};
pub use dlq_replay::{DlqReplayer, ReplayConfig};
pub use journal::{AccountId, EntryDraft, EventType, JournalEntry, Posting};
pub use ledger::{JournalStore, Ledger, LedgerError};
pub use money::{BasisPoints, Denomination, MicroUsd};
pub use pricing::{PricingEntry, PricingTable};
pub use reconcile::{ReconcileClient, ReconcileConfig, ReconcileRegistry, ReconcileStatus};
pub use reconcile_job::ReconcileJob;
pub use reserve::{
    balance_key, FinalizeOutcome, FinalizeRequest, ReserveConfig, ReserveEngine, ReserveOutcome,
};
pub use wal::{FileWal, MemoryWal, WalSink};
