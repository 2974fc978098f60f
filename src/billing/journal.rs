//! Journal Entries
//!
//! Every money-moving event is a balanced set of postings carrying an
//! event type. Entries are immutable once appended; the pair
//! (billing_entry_id, event_type, wal_offset) deduplicates WAL
//! replays. Posting rules for each event type live here as
//! constructors so no call site ever hand-assembles an unbalanced
//! entry.

use crate::billing::money::{Denomination, MicroUsd};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// ACCOUNTS
// =============================================================================

/// Opaque ledger account identifier.
///
/// Non-empty, no whitespace. Reserved namespaces:
/// `user:{id}:available`, `user:{id}:held`, `system:revenue`,
/// `system:reserves`, `system:credit_notes`, `treasury:usdc_received`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountIdError {
    Empty,
    ContainsWhitespace,
}

impl fmt::Display for AccountIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountIdError::Empty => write!(f, "account id must be non-empty"),
            AccountIdError::ContainsWhitespace => write!(f, "account id must not contain whitespace"),
        }
    }
}

impl std::error::Error for AccountIdError {}

impl AccountId {
    pub fn new(raw: impl Into<String>) -> Result<Self, AccountIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(AccountIdError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(AccountIdError::ContainsWhitespace);
        }
        Ok(AccountId(raw))
    }

    pub fn user_available(user: &str) -> Self {
        AccountId(format!("user:{}:available", user))
    }

    pub fn user_held(user: &str) -> Self {
        AccountId(format!("user:{}:held", user))
    }

    pub fn system_revenue() -> Self {
        AccountId("system:revenue".to_string())
    }

    pub fn system_reserves() -> Self {
        AccountId("system:reserves".to_string())
    }

    pub fn system_credit_notes() -> Self {
        AccountId("system:credit_notes".to_string())
    }

    pub fn treasury_usdc_received() -> Self {
        AccountId("treasury:usdc_received".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccountId::new(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// POSTINGS
// =============================================================================

/// One side of a double-entry transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account: AccountId,
    /// Signed micro-USD delta. The postings of an entry sum to zero.
    pub delta: MicroUsd,
    pub denom: Denomination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Posting {
    pub fn new(account: AccountId, delta: MicroUsd, denom: Denomination) -> Self {
        Posting {
            account,
            delta,
            denom,
            metadata: None,
        }
    }
}

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Journal event vocabulary. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CreditMint,
    BillingReserve,
    BillingCommit,
    BillingRelease,
    BillingVoid,
    X402CreditNote,
    ReconciliationCorrection,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CreditMint => "credit_mint",
            EventType::BillingReserve => "billing_reserve",
            EventType::BillingCommit => "billing_commit",
            EventType::BillingRelease => "billing_release",
            EventType::BillingVoid => "billing_void",
            EventType::X402CreditNote => "x402_credit_note",
            EventType::ReconciliationCorrection => "reconciliation_correction",
        }
    }
}

/// Rounding applied when the entry's amounts were computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundingDirection {
    #[default]
    Floor,
    Ceil,
}

/// Exchange rate frozen at reserve time (credit units per micro-USD,
/// in basis-point granularity). Carried so commit/void replay with
/// the same rate that quoted the reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenRate {
    pub numerator: u64,
    pub denominator: u64,
}

// =============================================================================
// JOURNAL ENTRY
// =============================================================================

/// An immutable, balanced journal record.
///
/// Field order is the stable serialization order. Deltas serialize as
/// canonical decimal strings; `timestamp_ms` is milliseconds since
/// epoch. `wal_offset` is assigned on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub billing_entry_id: String,
    pub event_type: EventType,
    pub correlation_id: String,
    pub postings: Vec<Posting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<FrozenRate>,
    #[serde(default)]
    pub rounding: RoundingDirection,
    pub wal_offset: u64,
    pub timestamp_ms: i64,
}

impl JournalEntry {
    /// Sum of posting deltas; zero for every valid entry.
    pub fn posting_sum(&self) -> MicroUsd {
        let mut sum = MicroUsd::zero();
        for p in &self.postings {
            sum += p.delta.clone();
        }
        sum
    }

    pub fn is_balanced(&self) -> bool {
        self.posting_sum().is_zero()
    }

    /// Dedupe key per invariant J2.
    pub fn dedupe_key(&self) -> (String, EventType, u64) {
        (
            self.billing_entry_id.clone(),
            self.event_type,
            self.wal_offset,
        )
    }
}

// =============================================================================
// POSTING RULES
// =============================================================================

/// Builder holding everything but the postings, which each event-type
/// constructor fills in per the posting rules.
pub struct EntryDraft {
    pub billing_entry_id: String,
    pub correlation_id: String,
    pub timestamp_ms: i64,
    pub exchange_rate: Option<FrozenRate>,
    pub rounding: RoundingDirection,
}

impl EntryDraft {
    pub fn new(
        billing_entry_id: impl Into<String>,
        correlation_id: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        EntryDraft {
            billing_entry_id: billing_entry_id.into(),
            correlation_id: correlation_id.into(),
            timestamp_ms,
            exchange_rate: None,
            rounding: RoundingDirection::default(),
        }
    }

    pub fn with_rate(mut self, rate: FrozenRate) -> Self {
        self.exchange_rate = Some(rate);
        self
    }

    pub fn with_rounding(mut self, rounding: RoundingDirection) -> Self {
        self.rounding = rounding;
        self
    }

    fn build(self, event_type: EventType, postings: Vec<Posting>) -> JournalEntry {
        JournalEntry {
            billing_entry_id: self.billing_entry_id,
            event_type,
            correlation_id: self.correlation_id,
            postings,
            exchange_rate: self.exchange_rate,
            rounding: self.rounding,
            wal_offset: 0, // assigned on append
            timestamp_ms: self.timestamp_ms,
        }
    }

    /// `billing_reserve(u, a)`: available -a, held +a.
    pub fn billing_reserve(self, user: &str, amount: &MicroUsd) -> JournalEntry {
        self.build(
            EventType::BillingReserve,
            vec![
                Posting::new(
                    AccountId::user_available(user),
                    -amount.clone(),
                    Denomination::MicroUsd,
                ),
                Posting::new(
                    AccountId::user_held(user),
                    amount.clone(),
                    Denomination::MicroUsd,
                ),
            ],
        )
    }

    /// `billing_commit(u, est, act)`: held -est, revenue +act,
    /// available +(est-act). The overage posting is omitted when zero
    /// and debits extra when actual exceeds the estimate.
    pub fn billing_commit(self, user: &str, estimated: &MicroUsd, actual: &MicroUsd) -> JournalEntry {
        let mut postings = vec![
            Posting::new(
                AccountId::user_held(user),
                -estimated.clone(),
                Denomination::MicroUsd,
            ),
            Posting::new(
                AccountId::system_revenue(),
                actual.clone(),
                Denomination::MicroUsd,
            ),
        ];
        let overage = estimated.clone() - actual.clone();
        if !overage.is_zero() {
            postings.push(Posting::new(
                AccountId::user_available(user),
                overage,
                Denomination::MicroUsd,
            ));
        }
        self.build(EventType::BillingCommit, postings)
    }

    /// `billing_release(u, a)`: held -a, available +a.
    pub fn billing_release(self, user: &str, amount: &MicroUsd) -> JournalEntry {
        self.build(
            EventType::BillingRelease,
            vec![
                Posting::new(
                    AccountId::user_held(user),
                    -amount.clone(),
                    Denomination::MicroUsd,
                ),
                Posting::new(
                    AccountId::user_available(user),
                    amount.clone(),
                    Denomination::MicroUsd,
                ),
            ],
        )
    }

    /// `billing_void(u, a)`: revenue -a, available +a.
    pub fn billing_void(self, user: &str, amount: &MicroUsd) -> JournalEntry {
        self.build(
            EventType::BillingVoid,
            vec![
                Posting::new(
                    AccountId::system_revenue(),
                    -amount.clone(),
                    Denomination::MicroUsd,
                ),
                Posting::new(
                    AccountId::user_available(user),
                    amount.clone(),
                    Denomination::MicroUsd,
                ),
            ],
        )
    }

    /// `credit_mint(u, a)`: treasury -a, available +a.
    pub fn credit_mint(self, user: &str, amount: &MicroUsd) -> JournalEntry {
        self.build(
            EventType::CreditMint,
            vec![
                Posting::new(
                    AccountId::treasury_usdc_received(),
                    -amount.clone(),
                    Denomination::MicroUsd,
                ),
                Posting::new(
                    AccountId::user_available(user),
                    amount.clone(),
                    Denomination::MicroUsd,
                ),
            ],
        )
    }

    /// `x402_credit_note(u, a)`: credit_notes -a, available +a.
    pub fn x402_credit_note(self, user: &str, amount: &MicroUsd) -> JournalEntry {
        self.build(
            EventType::X402CreditNote,
            vec![
                Posting::new(
                    AccountId::system_credit_notes(),
                    -amount.clone(),
                    Denomination::MicroUsd,
                ),
                Posting::new(
                    AccountId::user_available(user),
                    amount.clone(),
                    Denomination::MicroUsd,
                ),
            ],
        )
    }

    /// Reconciliation correction: pushes `account` by `delta`,
    /// balanced against system reserves. Payload metadata carries the
    /// derived-vs-cached evidence for audit.
    pub fn reconciliation_correction(
        self,
        account: AccountId,
        delta: &MicroUsd,
        evidence: serde_json::Value,
    ) -> JournalEntry {
        let mut corrected = Posting::new(account, delta.clone(), Denomination::MicroUsd);
        corrected.metadata = Some(evidence);
        self.build(
            EventType::ReconciliationCorrection,
            vec![
                corrected,
                Posting::new(
                    AccountId::system_reserves(),
                    -delta.clone(),
                    Denomination::MicroUsd,
                ),
            ],
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(id: &str) -> EntryDraft {
        EntryDraft::new(id, "trace-1", 1_700_000_000_000)
    }

    #[test]
    fn test_account_id_validation() {
        assert!(AccountId::new("user:a:available").is_ok());
        assert!(matches!(AccountId::new(""), Err(AccountIdError::Empty)));
        assert!(matches!(
            AccountId::new("user a"),
            Err(AccountIdError::ContainsWhitespace)
        ));
    }

    #[test]
    fn test_reserved_namespaces() {
        assert_eq!(AccountId::user_available("u1").as_str(), "user:u1:available");
        assert_eq!(AccountId::user_held("u1").as_str(), "user:u1:held");
        assert_eq!(AccountId::system_revenue().as_str(), "system:revenue");
        assert_eq!(AccountId::system_credit_notes().as_str(), "system:credit_notes");
        assert_eq!(
            AccountId::treasury_usdc_received().as_str(),
            "treasury:usdc_received"
        );
    }

    #[test]
    fn test_all_constructors_balance() {
        let hundred = MicroUsd::from_i64(100);
        let thirty = MicroUsd::from_i64(30);
        let entries = vec![
            draft("e1").billing_reserve("u1", &hundred),
            draft("e2").billing_commit("u1", &hundred, &thirty),
            draft("e3").billing_release("u1", &hundred),
            draft("e4").billing_void("u1", &thirty),
            draft("e5").credit_mint("u1", &hundred),
            draft("e6").x402_credit_note("u1", &thirty),
            draft("e7").reconciliation_correction(
                AccountId::user_available("u1"),
                &MicroUsd::from_i64(-7),
                serde_json::json!({"cached_balance": "107", "derived_balance": "100"}),
            ),
        ];
        for entry in entries {
            assert!(entry.is_balanced(), "{:?} unbalanced", entry.event_type);
        }
    }

    #[test]
    fn test_commit_omits_zero_overage() {
        let est = MicroUsd::from_i64(50);
        let entry = draft("e").billing_commit("u1", &est, &est);
        assert_eq!(entry.postings.len(), 2);
        assert!(entry.is_balanced());
    }

    #[test]
    fn test_commit_debits_extra_when_actual_exceeds_estimate() {
        let est = MicroUsd::from_i64(50);
        let act = MicroUsd::from_i64(80);
        let entry = draft("e").billing_commit("u1", &est, &act);
        assert!(entry.is_balanced());
        let avail = entry
            .postings
            .iter()
            .find(|p| p.account == AccountId::user_available("u1"))
            .unwrap();
        assert_eq!(avail.delta, MicroUsd::from_i64(-30));
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::BillingReserve).unwrap(),
            r#""billing_reserve""#
        );
        assert_eq!(
            serde_json::to_string(&EventType::X402CreditNote).unwrap(),
            r#""x402_credit_note""#
        );
        assert_eq!(
            serde_json::to_string(&EventType::ReconciliationCorrection).unwrap(),
            r#""reconciliation_correction""#
        );
    }

    #[test]
    fn test_entry_serialization_shape() {
        let entry = draft("res-1").billing_reserve("u1", &MicroUsd::from_i64(100_000));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event_type"], "billing_reserve");
        assert_eq!(json["postings"][0]["delta"], "-100000");
        assert_eq!(json["postings"][0]["denom"], "micro_usd");
        assert_eq!(json["timestamp_ms"], 1_700_000_000_000i64);
    }
}
