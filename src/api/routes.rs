//! API Routes
//! Mission: The enforcement surface for billed agent completions
//!
//! Business/marketplace routes live elsewhere; this surface is the
//! billed chat pipeline plus the operator read endpoints. Every error
//! body is `{error, code}` with a stable code, and provider error
//! bodies never leak.

use crate::api::pipeline::{estimate_prompt_tokens, PooledModel, ReconcileGate};
use crate::api::AppState;
use crate::auth::models::Claims;
use crate::billing::cache::Cache;
use crate::billing::credit_notes::{PaymentChallenge, Redemption};
use crate::billing::money::MicroUsd;
use crate::billing::reserve::{FinalizeOutcome, FinalizeRequest, ReserveOutcome};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::providers::ChatMessage;
use crate::routing::pools::{check_pool_access, PoolAccessError, PoolId, Tier};
use crate::routing::PersonalityProfile;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

// =============================================================================
// ERROR SHAPE
// =============================================================================

/// Business-layer error: `{error, code}` plus an optional 402
/// challenge.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub code: &'static str,
    pub challenge: Option<PaymentChallenge>,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, code: &'static str) -> Self {
        ApiError {
            status,
            error,
            code,
            challenge: None,
        }
    }

    fn payment_required(challenge: PaymentChallenge) -> Self {
        ApiError {
            status: StatusCode::PAYMENT_REQUIRED,
            error: "insufficient_funds",
            code: "PAYMENT_REQUIRED",
            challenge: Some(challenge),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.challenge {
            Some(challenge) => serde_json::json!({
                "error": self.error,
                "code": self.code,
                "challenge": challenge,
            }),
            None => serde_json::json!({
                "error": self.error,
                "code": self.code,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PoolAccessError> for ApiError {
    fn from(e: PoolAccessError) -> Self {
        match e {
            PoolAccessError::Unknown(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "unknown_pool", "UNKNOWN_POOL")
            }
            PoolAccessError::TierUnauthorized { .. } => ApiError::new(
                StatusCode::FORBIDDEN,
                "tier_unauthorized",
                "TIER_UNAUTHORIZED",
            ),
        }
    }
}

// =============================================================================
// REQUEST / RESPONSE SHAPES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Explicit pool request; otherwise affinity ranking decides.
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    /// Personality surface derived upstream from the agent NFT.
    #[serde(default)]
    pub archetype: Option<String>,
    #[serde(default)]
    pub dials: HashMap<String, f64>,
    /// Pools the tenant's deployment resolves to, if constrained.
    #[serde(default)]
    pub resolved_pools: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct ChatBilling {
    pub method: String,
    pub reserved_micro: MicroUsd,
    pub charged_micro: MicroUsd,
    pub credit_used_micro: MicroUsd,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub text: String,
    pub agent_id: String,
    pub pool: String,
    pub reservation_id: String,
    pub trace_id: String,
    pub iterations: u32,
    pub usage: ChatUsage,
    pub billing: ChatBilling,
}

const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 1024;

// =============================================================================
// CHAT
// =============================================================================

pub(crate) fn tier_of(claims: &Claims) -> Tier {
    claims
        .tier
        .as_deref()
        .and_then(|t| Tier::from_str(t).ok())
        .unwrap_or(Tier::Free)
}

pub(crate) fn select_pool(
    state: &AppState,
    tier: Tier,
    request: &ChatRequest,
) -> Result<PoolId, ApiError> {
    if let Some(requested) = &request.pool {
        return Ok(check_pool_access(tier, requested)?);
    }

    let resolved: Vec<PoolId> = match &request.resolved_pools {
        Some(ids) => {
            let mut pools = Vec::with_capacity(ids.len());
            for id in ids {
                pools.push(PoolId::from_str(id).map_err(|_| {
                    ApiError::new(StatusCode::BAD_REQUEST, "unknown_pool", "UNKNOWN_POOL")
                })?);
            }
            pools
        }
        None => crate::routing::ALL_POOLS.to_vec(),
    };

    let profile = PersonalityProfile {
        archetype: request.archetype.clone().unwrap_or_default(),
        dials: request.dials.clone(),
    };
    let ranked = state.affinity.rank_pools(tier, &profile, &resolved);
    if ranked.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "no_eligible_pool",
            "NO_ELIGIBLE_POOL",
        ));
    }

    // Prefer the highest-affinity pool whose model is currently
    // healthy; fall back to the top choice if every breaker is open
    // (it will 503 with a sanitized code downstream).
    for pool in &ranked {
        if let Some(entry) = state.pricing.entry(pool.as_str()) {
            if state.breaker.is_healthy(&entry.provider, &entry.model) {
                return Ok(*pool);
            }
        }
    }
    Ok(ranked[0])
}

#[allow(clippy::too_many_lines)]
pub async fn chat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let trace_id = Uuid::new_v4().to_string();
    let tenant = claims.sub.clone();
    let tier = tier_of(&claims);
    let now_ms = Utc::now().timestamp_millis();

    // Payment retry: a 402 challenge response redeemed via headers.
    let nonce = headers
        .get("X-Payment-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let receipt = headers
        .get("X-Payment-Receipt")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let (Some(nonce), Some(receipt)) = (nonce, receipt) {
        match state
            .x402
            .redeem_challenge(&tenant, &nonce, &receipt, &trace_id, now_ms)
            .await
        {
            Ok(Redemption::Accepted { amount }) => {
                info!(tenant = %tenant, amount = %amount, "payment redeemed on retry");
            }
            Ok(_) => {
                return Err(ApiError::new(
                    StatusCode::PAYMENT_REQUIRED,
                    "payment_invalid",
                    "PAYMENT_INVALID",
                ));
            }
            Err(e) => {
                error!(error = %e, "payment redemption hit a contract error");
                return Err(ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "INTERNAL",
                ));
            }
        }
    }

    // Routing under the tier-safety invariant.
    let pool = select_pool(&state, tier, &request)?;
    let pricing = state.pricing.entry(pool.as_str()).ok_or_else(|| {
        error!(pool = %pool, "pool missing from pricing table");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pricing_missing",
            "PRICING_MISSING",
        )
    })?;

    // Reconciliation admission gate.
    let reconcile = state.reconcile.client_for(&tenant);
    if !reconcile.should_allow_request() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "budget_reconciliation_closed",
            "FAIL_CLOSED",
        ));
    }

    // Quote.
    let mut messages = Vec::new();
    if let Some(system) = &request.system_prompt {
        messages.push(ChatMessage::system(system.clone()));
    }
    messages.push(ChatMessage::user(request.message.clone()));
    let prompt_estimate = estimate_prompt_tokens(&messages, pricing.bytes_per_token());
    let max_output = request
        .max_output_tokens
        .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
    let quote = pricing.quote_max_cost(prompt_estimate, max_output);

    // Outstanding credit reduces what must be reserved. Fails closed.
    let credit = state
        .x402
        .apply_credit_notes(&tenant, &quote)
        .await
        .map_err(|_| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "credit_balance_unavailable",
                "CACHE_UNAVAILABLE",
            )
        })?;
    let reserve_amount = credit.reduced.clone();
    let credit_used = credit.used.clone();

    // Reserve.
    let reservation_id = if reserve_amount.is_zero() {
        None
    } else {
        match state
            .engine
            .reserve(&tenant, pool.as_str(), &reserve_amount, &trace_id, now_ms)
            .await
        {
            Ok(ReserveOutcome::Reserved { reservation_id, .. }) => Some(reservation_id),
            Ok(ReserveOutcome::InsufficientFunds { available }) => {
                restore_credit(&state, &tenant, &credit_used).await;
                let shortfall = reserve_amount.clone() - available;
                let challenge = state
                    .x402
                    .issue_challenge(&shortfall, now_ms)
                    .await
                    .map_err(|_| {
                        ApiError::new(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "challenge_unavailable",
                            "CACHE_UNAVAILABLE",
                        )
                    })?;
                return Err(ApiError::payment_required(challenge));
            }
            Ok(ReserveOutcome::Unavailable) => {
                restore_credit(&state, &tenant, &credit_used).await;
                return Err(ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "reserve_unavailable",
                    "CACHE_UNAVAILABLE",
                ));
            }
            Err(e) => {
                error!(error = %e, "reserve hit a contract error");
                restore_credit(&state, &tenant, &credit_used).await;
                return Err(ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "INTERNAL",
                ));
            }
        }
    };

    // Execute the tool loop over the routed pool.
    let model = Arc::new(PooledModel::new(
        state.provider.clone(),
        state.breaker.clone(),
        pricing.clone(),
        prompt_estimate,
        max_output,
    ));
    let orchestrator = Orchestrator::new(
        model.clone(),
        state.tools.clone(),
        state.idempotency.clone(),
        state.limits.clone(),
    )
    .with_budget_checker(Arc::new(ReconcileGate(reconcile.clone())));

    let outcome = orchestrator
        .run(&trace_id, messages, Arc::new(AtomicBool::new(false)))
        .await;

    // Finalize: charge what the stream consumed, credits first.
    let actual = model.total_cost();
    let charged = settle(
        &state,
        &tenant,
        reservation_id.as_deref(),
        &actual,
        &credit_used,
        &trace_id,
    )
    .await;
    reconcile.record_local_spend(&charged.from_reserve);

    match outcome {
        Ok(loop_outcome) => Ok(Json(ChatResponse {
            text: loop_outcome.final_text,
            agent_id,
            pool: pool.as_str().to_string(),
            reservation_id: reservation_id.unwrap_or_default(),
            trace_id,
            iterations: loop_outcome.iterations,
            usage: ChatUsage {
                prompt_tokens: loop_outcome.usage_total.prompt_tokens,
                completion_tokens: loop_outcome.usage_total.completion_tokens,
                reasoning_tokens: loop_outcome.usage_total.reasoning_tokens,
            },
            billing: ChatBilling {
                method: model
                    .last_billing_method()
                    .unwrap_or("prompt_only")
                    .to_string(),
                reserved_micro: reserve_amount,
                charged_micro: charged.from_reserve,
                credit_used_micro: charged.from_credit,
            },
        })),
        Err(OrchestratorError::Provider(e)) => {
            warn!(trace_id = %trace_id, code = e.code(), "provider failure");
            Err(ApiError::new(
                StatusCode::BAD_GATEWAY,
                "provider_error",
                provider_code(&e),
            ))
        }
        Err(OrchestratorError::BudgetDenied) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "budget_reconciliation_closed",
            "FAIL_CLOSED",
        )),
        Err(e) => {
            warn!(trace_id = %trace_id, error = %e, "tool loop aborted");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "loop_aborted",
                loop_code(&e),
            ))
        }
    }
}

fn provider_code(e: &crate::providers::ProviderError) -> &'static str {
    use crate::providers::ProviderError;
    match e {
        ProviderError::RateLimited => "RATE_LIMITED",
        ProviderError::AuthError => "PROVIDER_AUTH",
        ProviderError::Timeout => "PROVIDER_TIMEOUT",
        ProviderError::ConnectionRefused => "PROVIDER_UNREACHABLE",
        ProviderError::Http { .. } | ProviderError::Malformed(_) => "PROVIDER_UNAVAILABLE",
    }
}

fn loop_code(e: &OrchestratorError) -> &'static str {
    match e {
        OrchestratorError::MaxIterationsExceeded { .. } => "LOOP_ITERATIONS_EXCEEDED",
        OrchestratorError::MaxToolCallsExceeded { .. } => "LOOP_TOOL_CALLS_EXCEEDED",
        OrchestratorError::WallTimeExceeded { .. } => "LOOP_WALL_TIME_EXCEEDED",
        OrchestratorError::ConsecutiveToolFailures { .. } => "LOOP_TOOL_FAILURES",
        OrchestratorError::Cancelled => "CANCELLED",
        OrchestratorError::BudgetDenied => "FAIL_CLOSED",
        OrchestratorError::Provider(_) => "PROVIDER_UNAVAILABLE",
    }
}

struct Settlement {
    from_credit: MicroUsd,
    from_reserve: MicroUsd,
}

/// Split the actual cost between consumed credit and the reservation,
/// refunding unconsumed credit and finalizing the hold. Finalize is
/// DLQ-backed, so this never loses a cost.
async fn settle(
    state: &AppState,
    tenant: &str,
    reservation_id: Option<&str>,
    actual: &MicroUsd,
    credit_used: &MicroUsd,
    trace_id: &str,
) -> Settlement {
    let now_ms = Utc::now().timestamp_millis();

    // Credit covers the first `credit_used` of actual cost.
    let (from_credit, from_reserve) = if actual <= credit_used {
        (actual.clone(), MicroUsd::zero())
    } else {
        (credit_used.clone(), actual.clone() - credit_used.clone())
    };
    // Unconsumed credit goes back to the note balance.
    let unused_credit = credit_used.clone() - from_credit.clone();
    if !unused_credit.is_zero() {
        restore_credit(state, tenant, &unused_credit).await;
    }

    if let Some(rid) = reservation_id {
        let outcome = state
            .engine
            .finalize(
                FinalizeRequest {
                    reservation_id: rid.to_string(),
                    tenant_id: tenant.to_string(),
                    actual_cost: from_reserve.clone(),
                    trace_id: trace_id.to_string(),
                    response_status: None,
                },
                now_ms,
            )
            .await;
        match outcome {
            Ok(FinalizeOutcome::Finalized { .. }) | Ok(FinalizeOutcome::Idempotent) => {}
            Ok(FinalizeOutcome::Dlq { reason }) => {
                warn!(reservation_id = rid, reason = %reason, "finalize deferred to dlq");
            }
            Ok(FinalizeOutcome::NotFound) => {
                warn!(reservation_id = rid, "finalize found no reservation");
            }
            Err(e) => error!(reservation_id = rid, error = %e, "finalize contract error"),
        }
    }

    Settlement {
        from_credit,
        from_reserve,
    }
}

async fn restore_credit(state: &AppState, tenant: &str, amount: &MicroUsd) {
    if let Err(e) = state.x402.refund_credit(tenant, amount).await {
        warn!(tenant = tenant, error = %e, "failed to restore unconsumed credit");
    }
}

// =============================================================================
// OPERATOR READS
// =============================================================================

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account: String,
    pub cached_micro: Option<String>,
    pub derived_micro: MicroUsd,
}

/// The authenticated tenant's balances (cached projection + ledger
/// derivation side by side).
pub async fn balances(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<Vec<BalanceResponse>> {
    let tenant = claims.sub;
    let mut out = Vec::new();
    for account in [
        crate::billing::journal::AccountId::user_available(&tenant),
        crate::billing::journal::AccountId::user_held(&tenant),
    ] {
        let cached = state
            .cache
            .get(&crate::billing::reserve::balance_key(&account))
            .await
            .ok()
            .flatten();
        out.push(BalanceResponse {
            account: account.as_str().to_string(),
            cached_micro: cached,
            derived_micro: state.journal.derive_balance(&account),
        });
    }
    Json(out)
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pending_dlq = state.engine.dlq().pending_count().await.unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "cache_healthy": state.cache.is_healthy(),
        "dlq_degraded": state.engine.dlq().is_degraded(),
        "dlq_pending": pending_dlq,
        "ledger_entries": state.journal.entry_count(),
    }))
}
