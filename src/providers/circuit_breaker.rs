//! Per-Model Circuit Breaker
//!
//! One breaker entry per (provider, model). CLOSED counts consecutive
//! health failures; OPEN rejects until a jittered `recovery_at`;
//! HALF_OPEN admits probes and closes after enough consecutive
//! successes. Unknown keys are optimistically healthy. Entries live in
//! process memory and are rebuilt from observed outcomes after a
//! restart.

use crate::providers::ProviderError;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive health failures before CLOSED -> OPEN.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before HALF_OPEN -> CLOSED.
    pub recovery_threshold: u32,
    /// Base OPEN duration before a probe is allowed.
    pub base_recovery: Duration,
    /// recovery_at = now + base ± base * jitter_pct.
    pub jitter_pct: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            unhealthy_threshold: 3,
            recovery_threshold: 2,
            base_recovery: Duration::from_secs(30),
            jitter_pct: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_error: Option<String>,
    recovery_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        BreakerEntry {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
            recovery_at: None,
        }
    }
}

/// Thread-safe breaker table.
pub struct CircuitBreaker {
    config: BreakerConfig,
    entries: RwLock<HashMap<(String, String), BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn jittered_recovery(&self, now: Instant) -> Instant {
        let base = self.config.base_recovery.as_secs_f64();
        let jitter = base * self.config.jitter_pct;
        let offset = if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        now + Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Query health, advancing OPEN -> HALF_OPEN when the recovery
    /// deadline has passed. Unknown keys are healthy.
    pub fn is_healthy(&self, provider: &str, model: &str) -> bool {
        self.is_healthy_at(provider, model, Instant::now())
    }

    pub fn is_healthy_at(&self, provider: &str, model: &str, now: Instant) -> bool {
        let key = (provider.to_string(), model.to_string());
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&key) else {
            return true;
        };
        match entry.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if entry.recovery_at.map(|t| now >= t).unwrap_or(true) {
                    transition(provider, model, entry, BreakerState::HalfOpen);
                    entry.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, provider: &str, model: &str) {
        let key = (provider.to_string(), model.to_string());
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.consecutive_failures = 0;
        match entry.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                entry.consecutive_successes += 1;
                if entry.consecutive_successes >= self.config.recovery_threshold {
                    transition(provider, model, entry, BreakerState::Closed);
                    entry.last_error = None;
                    entry.recovery_at = None;
                    entry.consecutive_successes = 0;
                }
            }
            BreakerState::Open => {
                // A success while OPEN means a caller bypassed the
                // breaker (or a probe raced the deadline); treat it as
                // a probe success.
                transition(provider, model, entry, BreakerState::HalfOpen);
                entry.consecutive_successes = 1;
            }
        }
    }

    pub fn record_failure(&self, provider: &str, model: &str, error: &ProviderError) {
        self.record_failure_at(provider, model, error, Instant::now());
    }

    pub fn record_failure_at(
        &self,
        provider: &str,
        model: &str,
        error: &ProviderError,
        now: Instant,
    ) {
        let key = (provider.to_string(), model.to_string());
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.last_error = Some(error.code().to_string());

        match entry.state {
            BreakerState::Closed => {
                // Only health failures count toward opening.
                if !error.is_health_failure() {
                    return;
                }
                entry.consecutive_failures += 1;
                entry.consecutive_successes = 0;
                if entry.consecutive_failures >= self.config.unhealthy_threshold {
                    transition(provider, model, entry, BreakerState::Open);
                    entry.recovery_at = Some(self.jittered_recovery(now));
                }
            }
            BreakerState::HalfOpen => {
                // Any failure during a probe re-opens.
                transition(provider, model, entry, BreakerState::Open);
                entry.consecutive_successes = 0;
                entry.recovery_at = Some(self.jittered_recovery(now));
            }
            BreakerState::Open => {
                if error.is_health_failure() {
                    entry.consecutive_failures += 1;
                }
            }
        }
    }

    pub fn state(&self, provider: &str, model: &str) -> BreakerState {
        self.entries
            .read()
            .get(&(provider.to_string(), model.to_string()))
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.entries
            .read()
            .iter()
            .map(|((provider, model), entry)| BreakerSnapshot {
                provider: provider.clone(),
                model: model.clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                consecutive_successes: entry.consecutive_successes,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }
}

/// Structured observability record for one (provider, model).
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub model: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

fn transition(provider: &str, model: &str, entry: &mut BreakerEntry, to: BreakerState) {
    let from = entry.state;
    entry.state = to;
    metrics::increment_counter!(
        "breaker_transitions_total",
        "provider" => provider.to_string(),
        "model" => model.to_string(),
        "to" => to.as_str(),
    );
    if to == BreakerState::Open {
        warn!(
            provider = provider,
            model = model,
            from = from.as_str(),
            to = to.as_str(),
            failures = entry.consecutive_failures,
            last_error = entry.last_error.as_deref().unwrap_or(""),
            "circuit breaker opened"
        );
    } else {
        info!(
            provider = provider,
            model = model,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker transition"
        );
    }
}

// =============================================================================
// TESTS
// =============================================================================
