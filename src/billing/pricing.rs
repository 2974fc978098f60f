//! Model Pricing
//!
//! Immutable pricing table loaded at startup from TOML and stamped
//! with a SHA-256 checksum. Prices are micro-USD per million tokens.
//! The cost formula floors; quoting ceils, so a reserve is always a
//! ceiling on the commit.

use crate::billing::money::MicroUsd;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Token multiplier in the price denomination (prices are per 1M tokens).
const TOKENS_PER_PRICE_UNIT: i64 = 1_000_000;

/// Fallback when a pricing entry does not specify one.
pub const DEFAULT_BYTES_PER_TOKEN: u32 = 4;

/// Pricing for one model pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub pool: String,
    pub provider: String,
    pub model: String,
    /// Micro-USD per 1M input tokens.
    pub input_price: MicroUsd,
    /// Micro-USD per 1M completion tokens.
    pub output_price: MicroUsd,
    /// Micro-USD per 1M reasoning tokens.
    pub reasoning_price: MicroUsd,
    #[serde(default)]
    pub bytes_per_token: Option<u32>,
}

impl PricingEntry {
    pub fn bytes_per_token(&self) -> u32 {
        self.bytes_per_token.unwrap_or(DEFAULT_BYTES_PER_TOKEN).max(1)
    }

    /// Floor-division cost:
    /// `input·p_in/1e6 + completion·p_out/1e6 + reasoning·p_reason/1e6`.
    pub fn cost(&self, input_tokens: u64, completion_tokens: u64, reasoning_tokens: u64) -> MicroUsd {
        let mut total = self
            .input_price
            .mul_div_floor(input_tokens as i64, TOKENS_PER_PRICE_UNIT);
        total += self
            .output_price
            .mul_div_floor(completion_tokens as i64, TOKENS_PER_PRICE_UNIT);
        total += self
            .reasoning_price
            .mul_div_floor(reasoning_tokens as i64, TOKENS_PER_PRICE_UNIT);
        total
    }

    /// Ceiling on cost for a reserve quote: assumes the full output
    /// budget is consumed at the completion+reasoning rate, rounded up
    /// to the next micro-USD.
    pub fn quote_max_cost(&self, prompt_tokens: u64, max_output_tokens: u64) -> MicroUsd {
        let mut numerator = self.input_price.mul_div_floor(prompt_tokens as i64, 1);
        numerator += self
            .output_price
            .checked_add(&self.reasoning_price)
            .mul_div_floor(max_output_tokens as i64, 1);
        // ceil(numerator / 1e6) = floor((numerator + 1e6 - 1) / 1e6)
        numerator += MicroUsd::from_i64(TOKENS_PER_PRICE_UNIT - 1);
        numerator.mul_div_floor(1, TOKENS_PER_PRICE_UNIT)
    }
}

#[derive(Debug, Deserialize)]
struct PricingFile {
    #[serde(rename = "pricing")]
    entries: Vec<PricingEntry>,
}

#[derive(Debug)]
pub enum PricingError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    DuplicatePool(String),
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingError::Io(e) => write!(f, "pricing table io error: {}", e),
            PricingError::Parse(e) => write!(f, "pricing table parse error: {}", e),
            PricingError::DuplicatePool(p) => write!(f, "duplicate pricing entry for pool {}", p),
        }
    }
}

impl std::error::Error for PricingError {}

/// Immutable pricing table keyed by pool id.
#[derive(Debug, Clone)]
pub struct PricingTable {
    by_pool: HashMap<String, PricingEntry>,
    /// SHA-256 of the source document, hex.
    pub checksum: String,
}

impl PricingTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PricingError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(PricingError::Io)?;
        let table = Self::from_toml(&raw)?;
        info!(
            path = %path.as_ref().display(),
            pools = table.by_pool.len(),
            checksum = %table.checksum,
            "loaded pricing table"
        );
        Ok(table)
    }

    pub fn from_toml(raw: &str) -> Result<Self, PricingError> {
        let parsed: PricingFile = toml::from_str(raw).map_err(PricingError::Parse)?;
        let checksum = hex::encode(Sha256::digest(raw.as_bytes()));
        let mut by_pool = HashMap::new();
        for entry in parsed.entries {
            let pool = entry.pool.clone();
            if by_pool.insert(pool.clone(), entry).is_some() {
                return Err(PricingError::DuplicatePool(pool));
            }
        }
        Ok(PricingTable { by_pool, checksum })
    }

    pub fn entry(&self, pool: &str) -> Option<&PricingEntry> {
        self.by_pool.get(pool)
    }

    pub fn pools(&self) -> impl Iterator<Item = &str> {
        self.by_pool.keys().map(|s| s.as_str())
    }

    /// Built-in table used when no pricing file is configured.
    pub fn builtin() -> Self {
        Self::from_toml(BUILTIN_PRICING).expect("builtin pricing table is valid")
    }
}

/// Default per-pool pricing. Prices are micro-USD per 1M tokens.
const BUILTIN_PRICING: &str = r#"
[[pricing]]
pool = "cheap"
provider = "openrouter"
model = "mini-8b"
input_price = "150000"
output_price = "600000"
reasoning_price = "0"
bytes_per_token = 4

[[pricing]]
pool = "fast-code"
provider = "openrouter"
model = "coder-32b"
input_price = "900000"
output_price = "3600000"
reasoning_price = "0"
bytes_per_token = 4

[[pricing]]
pool = "reviewer"
provider = "openrouter"
model = "reviewer-70b"
input_price = "1800000"
output_price = "7200000"
reasoning_price = "0"
bytes_per_token = 4

[[pricing]]
pool = "reasoning"
provider = "openrouter"
model = "thinker-long"
input_price = "3000000"
output_price = "12000000"
reasoning_price = "12000000"
bytes_per_token = 4

[[pricing]]
pool = "architect"
provider = "openrouter"
model = "architect-max"
input_price = "5000000"
output_price = "20000000"
reasoning_price = "20000000"
bytes_per_token = 3
"#;

// =============================================================================
// TESTS
// =============================================================================
