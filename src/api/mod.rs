//! API Module
//! Mission: Wire the serving edge to the billing core

pub mod pipeline;
pub mod routes;
pub mod stream;

use crate::auth::{auth_middleware, req_hash_middleware, AuthState};
use crate::billing::cache::Cache;
use crate::billing::credit_notes::X402Gateway;
use crate::billing::ledger::JournalStore;
use crate::billing::pricing::PricingTable;
use crate::billing::reconcile::ReconcileRegistry;
use crate::billing::reserve::ReserveEngine;
use crate::orchestrator::{IdempotencyCache, OrchestratorLimits, ToolExecutor};
use crate::providers::{CircuitBreaker, ModelProvider};
use crate::routing::AffinityTable;
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Everything a request handler needs, shared by Arc.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReserveEngine>,
    pub journal: Arc<JournalStore>,
    pub cache: Arc<dyn Cache>,
    pub pricing: Arc<PricingTable>,
    pub affinity: Arc<AffinityTable>,
    pub breaker: Arc<CircuitBreaker>,
    pub provider: Arc<dyn ModelProvider>,
    pub x402: Arc<X402Gateway>,
    pub reconcile: Arc<ReconcileRegistry>,
    pub idempotency: Arc<IdempotencyCache>,
    pub tools: Arc<dyn ToolExecutor>,
    pub limits: OrchestratorLimits,
}

/// Assemble the router: billed routes behind auth + req_hash, health
/// open.
pub fn router(state: AppState, auth: AuthState) -> Router {
    let protected = Router::new()
        .route("/api/v1/agents/:agent_id/chat", post(routes::chat))
        .route("/api/v1/agents/:agent_id/stream", get(stream::stream_chat))
        .route("/api/v1/balances", get(routes::balances))
        .layer(axum_mw::from_fn(req_hash_middleware))
        .layer(axum_mw::from_fn_with_state(auth, auth_middleware))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(routes::health))
        .with_state(state)
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(
            crate::middleware::logging::request_logging_simple,
        ))
}
