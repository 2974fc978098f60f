//! Budget Authority Reconciliation
//!
//! Periodically compares local spend against the upstream budget
//! authority's committed amount and gates admission through a
//! three-state machine:
//!
//! - SYNCED: drift within threshold; requests flow.
//! - FAIL_OPEN: drift detected or authority unreachable; requests are
//!   admitted against a bounded headroom that only ever decreases
//!   within an episode and is never refilled on exit.
//! - FAIL_CLOSED: headroom exhausted or the episode timed out; all
//!   requests denied until a successful reconciliation.
//!
//! The effective drift threshold preserves the literal upstream
//! algorithm: `dynamic = 0.1% of local_spend`; when `drift > dynamic`
//! the effective threshold is `max(configured, dynamic)`, otherwise
//! the configured threshold alone applies. The asymmetry is
//! intentional and pinned by test vectors.

use crate::billing::money::{BasisPoints, MicroUsd};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileStatus {
    Synced,
    FailOpen,
    FailClosed,
}

impl ReconcileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileStatus::Synced => "SYNCED",
            ReconcileStatus::FailOpen => "FAIL_OPEN",
            ReconcileStatus::FailClosed => "FAIL_CLOSED",
        }
    }
}

/// Authority response for `GET /api/v1/budget/{tenant_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub committed_micro: MicroUsd,
    pub reserved_micro: MicroUsd,
    pub limit_micro: MicroUsd,
    pub window_start: i64,
    pub window_end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    Unreachable(String),
    Timeout,
    BadResponse(String),
}

impl fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityError::Unreachable(msg) => write!(f, "authority unreachable: {}", msg),
            AuthorityError::Timeout => write!(f, "authority request timed out"),
            AuthorityError::BadResponse(msg) => write!(f, "authority bad response: {}", msg),
        }
    }
}

impl std::error::Error for AuthorityError {}

/// Capability: fetch a tenant's budget from the authority.
#[async_trait]
pub trait BudgetAuthority: Send + Sync {
    async fn fetch_budget(&self, tenant_id: &str) -> Result<BudgetSnapshot, AuthorityError>;
}

/// HTTP client for the budget authority.
pub struct HttpBudgetAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBudgetAuthority {
    pub fn new(base_url: String, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(HttpBudgetAuthority { client, base_url })
    }
}

#[async_trait]
impl BudgetAuthority for HttpBudgetAuthority {
    async fn fetch_budget(&self, tenant_id: &str) -> Result<BudgetSnapshot, AuthorityError> {
        let url = format!("{}/api/v1/budget/{}", self.base_url.trim_end_matches('/'), tenant_id);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                AuthorityError::Timeout
            } else {
                AuthorityError::Unreachable(e.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(AuthorityError::BadResponse(format!(
                "status {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<BudgetSnapshot>()
            .await
            .map_err(|e| AuthorityError::BadResponse(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub poll_interval: Duration,
    /// Static drift threshold floor.
    pub configured_threshold: MicroUsd,
    /// Headroom on FAIL_OPEN entry, as a share of the authority limit.
    pub headroom_percent: BasisPoints,
    /// Absolute cap on the entry headroom.
    pub headroom_abs_cap: MicroUsd,
    pub fail_open_max_duration: Duration,
    /// Fallback headroom base when the limit was never observed.
    pub unknown_limit_headroom: MicroUsd,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            poll_interval: Duration::from_secs(30),
            configured_threshold: MicroUsd::from_i64(10_000),
            headroom_percent: BasisPoints::new(1_000).unwrap_or_else(|_| unreachable!()),
            headroom_abs_cap: MicroUsd::from_i64(10_000_000),
            fail_open_max_duration: Duration::from_secs(5 * 60),
            unknown_limit_headroom: MicroUsd::from_i64(100_000),
        }
    }
}

/// Mutable reconciliation state, one per tenant client.
#[derive(Debug, Clone)]
pub struct ReconcileState {
    pub status: ReconcileStatus,
    pub last_sync_ms: Option<i64>,
    pub local_spend: MicroUsd,
    pub authority_committed: MicroUsd,
    pub fail_open_headroom_remaining: MicroUsd,
    pub fail_open_started_at_ms: Option<i64>,
    pub last_drift: MicroUsd,
    last_known_limit: Option<MicroUsd>,
}

impl Default for ReconcileState {
    fn default() -> Self {
        ReconcileState {
            status: ReconcileStatus::Synced,
            last_sync_ms: None,
            local_spend: MicroUsd::zero(),
            authority_committed: MicroUsd::zero(),
            fail_open_headroom_remaining: MicroUsd::zero(),
            fail_open_started_at_ms: None,
            last_drift: MicroUsd::zero(),
            last_known_limit: None,
        }
    }
}

pub struct ReconcileClient {
    tenant_id: String,
    authority: Arc<dyn BudgetAuthority>,
    config: ReconcileConfig,
    state: Mutex<ReconcileState>,
}

impl ReconcileClient {
    pub fn new(
        tenant_id: impl Into<String>,
        authority: Arc<dyn BudgetAuthority>,
        config: ReconcileConfig,
    ) -> Self {
        ReconcileClient {
            tenant_id: tenant_id.into(),
            authority,
            config,
            state: Mutex::new(ReconcileState::default()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn snapshot(&self) -> ReconcileState {
        self.state.lock().clone()
    }

    /// The literal upstream threshold algorithm.
    fn effective_threshold(&self, drift: &MicroUsd, local_spend: &MicroUsd) -> MicroUsd {
        let dynamic = local_spend.mul_div_floor(1, 1_000);
        if drift > &dynamic {
            if self.config.configured_threshold > dynamic {
                self.config.configured_threshold.clone()
            } else {
                dynamic
            }
        } else {
            self.config.configured_threshold.clone()
        }
    }

    fn enter_fail_open(&self, state: &mut ReconcileState, now_ms: i64, cause: &str) {
        let limit = state
            .last_known_limit
            .clone()
            .unwrap_or_else(|| self.config.unknown_limit_headroom.clone());
        let mut headroom = self.config.headroom_percent.apply(&limit);
        if headroom > self.config.headroom_abs_cap {
            headroom = self.config.headroom_abs_cap.clone();
        }
        state.status = ReconcileStatus::FailOpen;
        state.fail_open_headroom_remaining = headroom;
        state.fail_open_started_at_ms = Some(now_ms);
        warn!(
            tenant_id = %self.tenant_id,
            cause = cause,
            headroom = %state.fail_open_headroom_remaining,
            drift = %state.last_drift,
            "reconciliation entered FAIL_OPEN"
        );
        metrics::increment_counter!("reconcile_fail_open_total");
    }

    fn enter_fail_closed(&self, state: &mut ReconcileState, cause: &str) {
        state.status = ReconcileStatus::FailClosed;
        warn!(tenant_id = %self.tenant_id, cause = cause, "reconciliation entered FAIL_CLOSED");
        metrics::increment_counter!("reconcile_fail_closed_total");
    }

    /// Record spend committed locally. In FAIL_OPEN this draws down
    /// the episode headroom; exhaustion closes the gate.
    pub fn record_local_spend(&self, cost: &MicroUsd) {
        let mut state = self.state.lock();
        state.local_spend += cost.clone();
        if state.status == ReconcileStatus::FailOpen {
            state.fail_open_headroom_remaining =
                state.fail_open_headroom_remaining.clone() - cost.clone();
            if !state.fail_open_headroom_remaining.is_positive() {
                // Floor at zero; headroom is monotone within an episode.
                state.fail_open_headroom_remaining = MicroUsd::zero();
                self.enter_fail_closed(&mut state, "headroom_exhausted");
            }
        }
    }

    /// Admission gate. Side-effect-free except for the implicit
    /// FAIL_OPEN -> FAIL_CLOSED transition on an expired episode.
    pub fn should_allow_request(&self) -> bool {
        self.should_allow_request_at(Utc::now().timestamp_millis())
    }

    pub fn should_allow_request_at(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock();
        match state.status {
            ReconcileStatus::Synced => true,
            ReconcileStatus::FailClosed => false,
            ReconcileStatus::FailOpen => {
                if let Some(started) = state.fail_open_started_at_ms {
                    let elapsed = now_ms.saturating_sub(started);
                    if elapsed > self.config.fail_open_max_duration.as_millis() as i64 {
                        self.enter_fail_closed(&mut state, "fail_open_timeout");
                        return false;
                    }
                }
                state.fail_open_headroom_remaining.is_positive()
            }
        }
    }

    /// One authority poll.
    pub async fn poll_once_at(&self, now_ms: i64) {
        let result = self.authority.fetch_budget(&self.tenant_id).await;
        let mut state = self.state.lock();

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                match state.status {
                    ReconcileStatus::Synced => {
                        // Unreachable authority bounds admission
                        // instead of failing requests outright.
                        state.last_drift = MicroUsd::zero();
                        self.enter_fail_open(&mut state, now_ms, "authority_unreachable");
                    }
                    // An unreachable authority never re-enters
                    // FAIL_OPEN (headroom would refill) and never
                    // reopens a closed gate.
                    ReconcileStatus::FailOpen | ReconcileStatus::FailClosed => {
                        warn!(tenant_id = %self.tenant_id, error = %e, "authority still unreachable");
                    }
                }
                return;
            }
        };

        state.authority_committed = snapshot.committed_micro.clone();
        state.last_known_limit = Some(snapshot.limit_micro.clone());

        let drift = (state.local_spend.clone() - snapshot.committed_micro.clone()).abs();
        state.last_drift = drift.clone();
        let threshold = self.effective_threshold(&drift, &state.local_spend);

        if drift > threshold {
            if state.status == ReconcileStatus::Synced {
                self.enter_fail_open(&mut state, now_ms, "drift_threshold_exceeded");
            }
            // Already FAIL_OPEN or FAIL_CLOSED: no transition, and in
            // particular no headroom refill.
        } else {
            if state.status != ReconcileStatus::Synced {
                info!(
                    tenant_id = %self.tenant_id,
                    drift = %drift,
                    "reconciliation returned to SYNCED"
                );
            }
            state.status = ReconcileStatus::Synced;
            state.last_sync_ms = Some(now_ms);
            state.fail_open_started_at_ms = None;
            // Headroom is deliberately left as-is: a later FAIL_OPEN
            // episode recomputes from scratch on entry.
        }
    }

    /// Long-running poll loop. Spawned at boot.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once_at(Utc::now().timestamp_millis()).await;
        }
    }
}

// =============================================================================
// PER-TENANT REGISTRY
// =============================================================================

/// One reconciliation client per active tenant, created lazily on the
/// first billed request and polled together.
pub struct ReconcileRegistry {
    authority: Arc<dyn BudgetAuthority>,
    config: ReconcileConfig,
    clients: Mutex<std::collections::HashMap<String, Arc<ReconcileClient>>>,
}

impl ReconcileRegistry {
    pub fn new(authority: Arc<dyn BudgetAuthority>, config: ReconcileConfig) -> Self {
        ReconcileRegistry {
            authority,
            config,
            clients: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn client_for(&self, tenant_id: &str) -> Arc<ReconcileClient> {
        let mut clients = self.clients.lock();
        clients
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(ReconcileClient::new(
                    tenant_id,
                    self.authority.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub async fn poll_all_at(&self, now_ms: i64) {
        let clients: Vec<Arc<ReconcileClient>> = self.clients.lock().values().cloned().collect();
        for client in clients {
            client.poll_once_at(now_ms).await;
        }
    }

    /// Shared poll loop for every registered tenant.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_all_at(Utc::now().timestamp_millis()).await;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
