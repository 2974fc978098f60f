//! x402 Credit Notes and Payment Challenges
//!
//! Off-chain credit handling: goodwill credit notes (quoted-vs-actual
//! deltas), HMAC-signed 402 payment challenges, and payment-nonce
//! replay records. No wallet-level settlement happens here; a
//! redeemed challenge mints ledger credit and nothing else.
//!
//! Key layout:
//!
//! ```text
//! x402:credit:{wallet}:{id}    individual note JSON
//! x402:credit:{wallet}:balance decimal balance
//! x402:challenge:{nonce}       outstanding challenge JSON, TTL
//! x402:payment:{payment_id}    nonce replay record
//! ```

use crate::billing::cache::{Cache, CacheError, CacheResult};
use crate::billing::journal::EntryDraft;
use crate::billing::ledger::{JournalError, JournalStore};
use crate::billing::money::MicroUsd;
use crate::billing::reserve::balance_key;
use crate::billing::journal::AccountId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Digest scheme recorded on payment ids. The sha256 construction is
/// a known-weak placeholder for keccak-256; swapping the hash only
/// changes [`payment_id_digest`].
pub const PAYMENT_ID_DIGEST: &str = "sha256-placeholder";

/// Placeholder payment-id digest over (wallet, nonce, amount).
pub fn payment_id_digest(wallet: &str, nonce: &str, amount: &MicroUsd) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wallet.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.as_bytes());
    hasher.update(b":");
    hasher.update(amount.to_wire().as_bytes());
    hex::encode(hasher.finalize())
}

/// One issued credit note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditNote {
    pub id: String,
    pub wallet: String,
    pub amount: MicroUsd,
    pub reason: String,
    pub issued_at_ms: i64,
}

/// Result of applying credit against an amount due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditApplication {
    /// What the tenant still owes after credit.
    pub reduced: MicroUsd,
    /// Credit consumed by this application.
    pub used: MicroUsd,
    /// Credit balance left afterwards.
    pub remaining: MicroUsd,
}

/// The 402 challenge body shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChallenge {
    pub nonce: String,
    pub amount: MicroUsd,
    pub recipient: String,
    pub chain_id: u64,
    pub expires_at: i64,
    pub hmac: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redemption {
    Accepted { amount: MicroUsd },
    UnknownNonce,
    Expired,
    /// Payment nonce already consumed.
    Replayed,
    BadSignature,
}

#[derive(Debug, Clone)]
pub struct X402Config {
    pub recipient: String,
    pub chain_id: u64,
    pub challenge_ttl: Duration,
}

impl Default for X402Config {
    fn default() -> Self {
        X402Config {
            recipient: "0x0000000000000000000000000000000000000000".to_string(),
            chain_id: 8453,
            challenge_ttl: Duration::from_secs(10 * 60),
        }
    }
}

pub struct X402Gateway {
    cache: Arc<dyn Cache>,
    journal: Arc<JournalStore>,
    secret: Vec<u8>,
    config: X402Config,
}

impl X402Gateway {
    pub fn new(
        cache: Arc<dyn Cache>,
        journal: Arc<JournalStore>,
        secret: Vec<u8>,
        config: X402Config,
    ) -> Self {
        X402Gateway {
            cache,
            journal,
            secret,
            config,
        }
    }

    fn note_key(wallet: &str, id: &str) -> String {
        format!("x402:credit:{}:{}", wallet, id)
    }

    fn balance_key_for(wallet: &str) -> String {
        format!("x402:credit:{}:balance", wallet)
    }

    fn challenge_key(nonce: &str) -> String {
        format!("x402:challenge:{}", nonce)
    }

    fn payment_key(payment_id: &str) -> String {
        format!("x402:payment:{}", payment_id)
    }

    fn sign(&self, nonce: &str, amount: &MicroUsd, expires_at: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(nonce.as_bytes());
        mac.update(b"|");
        mac.update(amount.to_wire().as_bytes());
        mac.update(b"|");
        mac.update(self.config.recipient.as_bytes());
        mac.update(b"|");
        mac.update(self.config.chain_id.to_string().as_bytes());
        mac.update(b"|");
        mac.update(expires_at.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // -------------------------------------------------------------------------
    // CREDIT NOTES
    // -------------------------------------------------------------------------

    /// Mint a goodwill credit note (e.g. a quoted-vs-actual delta).
    /// Journals an `x402_credit_note` entry and projects both the
    /// note balance and the available balance.
    pub async fn mint_credit_note(
        &self,
        wallet: &str,
        amount: &MicroUsd,
        reason: &str,
        trace_id: &str,
        now_ms: i64,
    ) -> Result<CreditNote, JournalError> {
        let note = CreditNote {
            id: Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            amount: amount.clone(),
            reason: reason.to_string(),
            issued_at_ms: now_ms,
        };

        let entry = EntryDraft::new(format!("credit-note-{}", note.id), trace_id, now_ms)
            .x402_credit_note(wallet, amount);
        self.journal.append(entry)?;

        if let Ok(raw) = serde_json::to_string(&note) {
            let _ = self.cache.set(&Self::note_key(wallet, &note.id), &raw, None).await;
        }
        let _ = self
            .cache
            .incr_decimal(&Self::balance_key_for(wallet), &amount.to_wire())
            .await;
        let _ = self
            .cache
            .incr_decimal(
                &balance_key(&AccountId::user_available(wallet)),
                &amount.to_wire(),
            )
            .await;

        metrics::increment_counter!("credit_notes_minted_total");
        info!(wallet = wallet, amount = %amount, reason = reason, "credit note minted");
        Ok(note)
    }

    /// Apply outstanding credit against an amount due. Atomic on the
    /// note balance. Fails closed (error) when the cache is down: new
    /// spends must not guess at credit.
    pub async fn apply_credit_notes(
        &self,
        wallet: &str,
        amount_due: &MicroUsd,
    ) -> CacheResult<CreditApplication> {
        let key = Self::balance_key_for(wallet);
        let balance = match self.cache.get(&key).await? {
            Some(raw) => MicroUsd::parse_canonical(&raw)
                .map_err(|e| CacheError::Corrupt(format!("{}: {}", key, e)))?,
            None => MicroUsd::zero(),
        };

        let used = if &balance < amount_due {
            balance.clone()
        } else {
            amount_due.clone()
        };
        if !used.is_zero() {
            self.cache
                .incr_decimal(&key, &(-used.clone()).to_wire())
                .await?;
        }

        Ok(CreditApplication {
            reduced: amount_due.clone() - used.clone(),
            used: used.clone(),
            remaining: balance - used,
        })
    }

    /// Return unconsumed credit to the note balance (e.g. when a
    /// reserve fails after credit was applied, or actual cost came in
    /// under the applied amount).
    pub async fn refund_credit(&self, wallet: &str, amount: &MicroUsd) -> CacheResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.cache
            .incr_decimal(&Self::balance_key_for(wallet), &amount.to_wire())
            .await?;
        Ok(())
    }

    pub async fn credit_balance(&self, wallet: &str) -> CacheResult<MicroUsd> {
        match self.cache.get(&Self::balance_key_for(wallet)).await? {
            Some(raw) => MicroUsd::parse_canonical(&raw)
                .map_err(|e| CacheError::Corrupt(e.to_string())),
            None => Ok(MicroUsd::zero()),
        }
    }

    // -------------------------------------------------------------------------
    // 402 CHALLENGES
    // -------------------------------------------------------------------------

    /// Build and store a signed payment challenge for an underfunded
    /// request.
    pub async fn issue_challenge(
        &self,
        amount: &MicroUsd,
        now_ms: i64,
    ) -> CacheResult<PaymentChallenge> {
        let nonce = Uuid::new_v4().to_string();
        let expires_at = now_ms + self.config.challenge_ttl.as_millis() as i64;
        let challenge = PaymentChallenge {
            nonce: nonce.clone(),
            amount: amount.clone(),
            recipient: self.config.recipient.clone(),
            chain_id: self.config.chain_id,
            expires_at,
            hmac: self.sign(&nonce, amount, expires_at),
        };
        let raw = serde_json::to_string(&challenge)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        self.cache
            .set(&Self::challenge_key(&nonce), &raw, Some(self.config.challenge_ttl))
            .await?;
        metrics::increment_counter!("x402_challenges_issued_total");
        Ok(challenge)
    }

    /// Redeem a challenge presented on retry via the
    /// `X-Payment-Nonce` / `X-Payment-Receipt` headers. The nonce
    /// must reference a live challenge with an intact signature, and
    /// the derived payment id must never have been consumed.
    pub async fn redeem_challenge(
        &self,
        wallet: &str,
        nonce: &str,
        receipt: &str,
        trace_id: &str,
        now_ms: i64,
    ) -> Result<Redemption, JournalError> {
        let raw = match self.cache.get(&Self::challenge_key(nonce)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Redemption::UnknownNonce),
            // Replay guard unavailable: fail closed.
            Err(_) => return Ok(Redemption::Replayed),
        };
        let challenge: PaymentChallenge = match serde_json::from_str(&raw) {
            Ok(c) => c,
            Err(_) => return Ok(Redemption::UnknownNonce),
        };

        if now_ms > challenge.expires_at {
            return Ok(Redemption::Expired);
        }
        let expected = self.sign(&challenge.nonce, &challenge.amount, challenge.expires_at);
        if expected != challenge.hmac {
            warn!(nonce = nonce, "challenge signature mismatch");
            return Ok(Redemption::BadSignature);
        }
        if receipt.trim().is_empty() {
            return Ok(Redemption::BadSignature);
        }

        // Payment-nonce replay guard, fail closed.
        let payment_id = payment_id_digest(wallet, nonce, &challenge.amount);
        let record = serde_json::json!({
            "wallet": wallet,
            "nonce": nonce,
            "receipt": receipt,
            "digest": PAYMENT_ID_DIGEST,
            "redeemed_at_ms": now_ms,
        })
        .to_string();
        match self
            .cache
            .set_nx(&Self::payment_key(&payment_id), &record, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(Redemption::Replayed),
            Err(_) => return Ok(Redemption::Replayed),
        }
        let _ = self.cache.del(&Self::challenge_key(nonce)).await;

        // Paid: mint ledger credit from the treasury.
        let entry = EntryDraft::new(format!("payment-{}", payment_id), trace_id, now_ms)
            .credit_mint(wallet, &challenge.amount);
        self.journal.append(entry)?;
        let _ = self
            .cache
            .incr_decimal(
                &balance_key(&AccountId::user_available(wallet)),
                &challenge.amount.to_wire(),
            )
            .await;

        metrics::increment_counter!("x402_payments_redeemed_total");
        info!(wallet = wallet, amount = %challenge.amount, "payment challenge redeemed");
        Ok(Redemption::Accepted {
            amount: challenge.amount,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
