//! WebSocket Streaming Route
//!
//! Streams a single completion back frame by frame. The upgrade is
//! gated by the jti replay guard (enforced in the auth middleware);
//! billing runs through the same reserve/finalize engine as the HTTP
//! route. A client disconnect mid-stream aborts the tracker and bills
//! the overcounted byte estimate, biased toward the provider, unless
//! a usage event was already observed.

use crate::api::pipeline::estimate_prompt_tokens;
use crate::api::routes::{select_pool, tier_of, ChatRequest};
use crate::api::AppState;
use crate::auth::models::Claims;
use crate::billing::cost_tracker::CostTracker;
use crate::billing::money::MicroUsd;
use crate::billing::reserve::{FinalizeRequest, ReserveOutcome};
use crate::providers::{ChatMessage, CompletionRequest, StreamEvent};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::Response,
    Extension,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_STREAM_MAX_OUTPUT_TOKENS: u64 = 1024;

pub async fn stream_chat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Extension(claims): Extension<Claims>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, agent_id, claims, socket))
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> bool {
    socket.send(Message::Text(value.to_string())).await.is_ok()
}

async fn handle_socket(state: AppState, agent_id: String, claims: Claims, mut socket: WebSocket) {
    let trace_id = Uuid::new_v4().to_string();
    let tenant = claims.sub.clone();
    let now_ms = Utc::now().timestamp_millis();

    // First client frame carries the request.
    let request: ChatRequest = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(raw))) => match serde_json::from_str(&raw) {
                Ok(request) => break request,
                Err(e) => {
                    debug!(error = %e, "bad stream request frame");
                    let _ = send_json(
                        &mut socket,
                        json!({"error": "bad_request", "code": "BAD_REQUEST"}),
                    )
                    .await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let tier = tier_of(&claims);
    let pool = match select_pool(&state, tier, &request) {
        Ok(pool) => pool,
        Err(e) => {
            let _ = send_json(&mut socket, json!({"error": e.error, "code": e.code})).await;
            return;
        }
    };
    let Some(pricing) = state.pricing.entry(pool.as_str()).cloned() else {
        let _ = send_json(
            &mut socket,
            json!({"error": "pricing_missing", "code": "PRICING_MISSING"}),
        )
        .await;
        return;
    };

    let reconcile = state.reconcile.client_for(&tenant);
    if !reconcile.should_allow_request() {
        let _ = send_json(
            &mut socket,
            json!({"error": "budget_reconciliation_closed", "code": "FAIL_CLOSED"}),
        )
        .await;
        return;
    }

    // Quote and reserve.
    let mut messages = Vec::new();
    if let Some(system) = &request.system_prompt {
        messages.push(ChatMessage::system(system.clone()));
    }
    messages.push(ChatMessage::user(request.message.clone()));
    let prompt_estimate = estimate_prompt_tokens(&messages, pricing.bytes_per_token());
    let max_output = request
        .max_output_tokens
        .unwrap_or(DEFAULT_STREAM_MAX_OUTPUT_TOKENS);
    let quote = pricing.quote_max_cost(prompt_estimate, max_output);

    let reservation_id = match state
        .engine
        .reserve(&tenant, pool.as_str(), &quote, &trace_id, now_ms)
        .await
    {
        Ok(ReserveOutcome::Reserved { reservation_id, .. }) => reservation_id,
        Ok(ReserveOutcome::InsufficientFunds { available }) => {
            let challenge = state.x402.issue_challenge(&(quote - available), now_ms).await;
            let body = match challenge {
                Ok(challenge) => json!({
                    "error": "insufficient_funds",
                    "code": "PAYMENT_REQUIRED",
                    "challenge": challenge,
                }),
                Err(_) => json!({
                    "error": "insufficient_funds",
                    "code": "PAYMENT_REQUIRED",
                }),
            };
            let _ = send_json(&mut socket, body).await;
            return;
        }
        Ok(ReserveOutcome::Unavailable) => {
            let _ = send_json(
                &mut socket,
                json!({"error": "reserve_unavailable", "code": "CACHE_UNAVAILABLE"}),
            )
            .await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "reserve contract error on stream");
            let _ = send_json(&mut socket, json!({"error": "internal", "code": "INTERNAL"})).await;
            return;
        }
    };

    // Open the model stream through the breaker.
    let provider_name = pricing.provider.clone();
    let model_name = pricing.model.clone();
    let healthy = state.breaker.is_healthy(&provider_name, &model_name);
    let rx = if healthy {
        state
            .provider
            .stream_completion(CompletionRequest {
                provider: pricing.provider.clone(),
                model: pricing.model.clone(),
                messages,
                tools: Vec::new(),
                max_output_tokens: max_output,
            })
            .await
    } else {
        Err(crate::providers::ProviderError::Http { status: 503 })
    };
    let rx = match rx {
        Ok(rx) => rx,
        Err(e) => {
            if healthy {
                state.breaker.record_failure(&provider_name, &model_name, &e);
            }
            let _ = send_json(
                &mut socket,
                json!({"error": "provider_error", "code": e.code()}),
            )
            .await;
            // Nothing streamed: release the hold.
            finalize(&state, &reservation_id, &tenant, MicroUsd::zero(), &trace_id).await;
            return;
        }
    };

    // Pass-through: forward events while the tracker accumulates.
    let mut tracker = CostTracker::new(rx, pricing, prompt_estimate);
    let mut provider_failed = false;
    loop {
        tokio::select! {
            event = tracker.next() => match event {
                Some(StreamEvent::Chunk { delta_text }) => {
                    if !send_json(&mut socket, json!({"type": "chunk", "delta": delta_text})).await {
                        tracker.abort();
                        break;
                    }
                }
                Some(StreamEvent::ToolCall { .. }) | Some(StreamEvent::Usage(_)) => {}
                Some(StreamEvent::Done) | None => break,
                Some(StreamEvent::Error(e)) => {
                    provider_failed = true;
                    state.breaker.record_failure(&provider_name, &model_name, &e);
                    let _ = send_json(
                        &mut socket,
                        json!({"type": "error", "code": e.code()}),
                    )
                    .await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    tracker.abort();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    if !provider_failed && !tracker.was_aborted() {
        state.breaker.record_success(&provider_name, &model_name);
    }

    // Terminal attribution: aborted streams bias toward the provider,
    // trusting usage when it arrived before the abort.
    let result = if tracker.was_aborted() {
        tracker.overcount_result(true)
    } else {
        tracker.result()
    };
    finalize(&state, &reservation_id, &tenant, result.cost.clone(), &trace_id).await;
    reconcile.record_local_spend(&result.cost);

    info!(
        agent_id = %agent_id,
        tenant = %tenant,
        reservation_id = %reservation_id,
        cost = %result.cost,
        method = result.method.as_str(),
        aborted = result.was_aborted,
        "stream billed"
    );

    if !result.was_aborted {
        let _ = send_json(
            &mut socket,
            json!({
                "type": "done",
                "billing": {
                    "method": result.method.as_str(),
                    "charged_micro": result.cost,
                },
                "usage": {
                    "prompt_tokens": result.prompt_tokens,
                    "completion_tokens": result.completion_tokens,
                    "reasoning_tokens": result.reasoning_tokens,
                },
            }),
        )
        .await;
        let _ = socket.send(Message::Close(None)).await;
    }
}

async fn finalize(
    state: &AppState,
    reservation_id: &str,
    tenant: &str,
    actual: MicroUsd,
    trace_id: &str,
) {
    let outcome = state
        .engine
        .finalize(
            FinalizeRequest {
                reservation_id: reservation_id.to_string(),
                tenant_id: tenant.to_string(),
                actual_cost: actual,
                trace_id: trace_id.to_string(),
                response_status: None,
            },
            Utc::now().timestamp_millis(),
        )
        .await;
    if let Err(e) = outcome {
        warn!(reservation_id = reservation_id, error = %e, "stream finalize contract error");
    }
}
