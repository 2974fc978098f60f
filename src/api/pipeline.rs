//! Billed Request Pipeline
//!
//! Glue between the orchestrator's capability seams and the billing
//! core: a `Model` implementation that streams through the cost
//! tracker and reports outcomes to the circuit breaker, and the
//! admission gate backed by the reconciliation client.

use crate::billing::cost_tracker::{CostResult, CostTracker};
use crate::billing::money::MicroUsd;
use crate::billing::pricing::PricingEntry;
use crate::billing::reconcile::ReconcileClient;
use crate::orchestrator::{BudgetChecker, Completion, Model, ToolInvocation};
use crate::providers::{
    ChatMessage, CircuitBreaker, CompletionRequest, ModelProvider, ProviderError, StreamEvent,
    ToolSpec, UsageReport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A routed pool bound to one request. Each completion turn streams
/// through a fresh cost tracker; per-turn costs accumulate for the
/// final commit.
pub struct PooledModel {
    provider: Arc<dyn ModelProvider>,
    breaker: Arc<CircuitBreaker>,
    pricing: PricingEntry,
    prompt_tokens_estimate: u64,
    max_output_tokens: u64,
    turn_costs: Mutex<Vec<CostResult>>,
}

impl PooledModel {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        breaker: Arc<CircuitBreaker>,
        pricing: PricingEntry,
        prompt_tokens_estimate: u64,
        max_output_tokens: u64,
    ) -> Self {
        PooledModel {
            provider,
            breaker,
            pricing,
            prompt_tokens_estimate,
            max_output_tokens,
            turn_costs: Mutex::new(Vec::new()),
        }
    }

    /// Sum of per-turn terminal costs.
    pub fn total_cost(&self) -> MicroUsd {
        let mut total = MicroUsd::zero();
        for result in self.turn_costs.lock().iter() {
            total += result.cost.clone();
        }
        total
    }

    /// Billing method of the last turn, for response metadata.
    pub fn last_billing_method(&self) -> Option<&'static str> {
        self.turn_costs
            .lock()
            .last()
            .map(|result| result.method.as_str())
    }

    pub fn turn_count(&self) -> usize {
        self.turn_costs.lock().len()
    }
}

/// In-progress tool-call assembly: streamed argument fragments are
/// concatenated per index.
#[derive(Default)]
struct ToolCallAssembly {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl Model for PooledModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, ProviderError> {
        let provider_name = self.pricing.provider.as_str();
        let model_name = self.pricing.model.as_str();

        if !self.breaker.is_healthy(provider_name, model_name) {
            // Short-circuit; not recorded as a failure.
            return Err(ProviderError::Http { status: 503 });
        }

        let request = CompletionRequest {
            provider: self.pricing.provider.clone(),
            model: self.pricing.model.clone(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            max_output_tokens: self.max_output_tokens,
        };

        let rx = match self.provider.stream_completion(request).await {
            Ok(rx) => rx,
            Err(e) => {
                self.breaker.record_failure(provider_name, model_name, &e);
                return Err(e);
            }
        };

        let mut tracker = CostTracker::new(rx, self.pricing.clone(), self.prompt_tokens_estimate);
        let mut text = String::new();
        let mut assemblies: BTreeMap<u32, ToolCallAssembly> = BTreeMap::new();
        let mut stream_error: Option<ProviderError> = None;

        while let Some(event) = tracker.next().await {
            match event {
                StreamEvent::Chunk { delta_text } => text.push_str(&delta_text),
                StreamEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let assembly = assemblies.entry(index).or_default();
                    if !id.is_empty() {
                        assembly.id = id;
                    }
                    if !name.is_empty() {
                        assembly.name = name;
                    }
                    assembly.arguments.push_str(&arguments);
                }
                StreamEvent::Usage(_) => {}
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
        }

        // The turn is billed whether or not it ended cleanly.
        let result = tracker.result();
        self.turn_costs.lock().push(result.clone());

        match stream_error {
            Some(e) => {
                self.breaker.record_failure(provider_name, model_name, &e);
                Err(e)
            }
            None => {
                self.breaker.record_success(provider_name, model_name);
                let tool_calls: Vec<ToolInvocation> = assemblies
                    .into_values()
                    .filter(|a| !a.name.is_empty())
                    .map(|a| ToolInvocation {
                        id: a.id,
                        name: a.name,
                        arguments: a.arguments,
                    })
                    .collect();
                let usage = UsageReport {
                    prompt_tokens: result.prompt_tokens,
                    completion_tokens: result.completion_tokens,
                    reasoning_tokens: result.reasoning_tokens,
                };
                Ok(Completion {
                    text,
                    tool_calls,
                    usage: Some(usage),
                })
            }
        }
    }
}

/// Reconciliation-backed admission gate for the orchestrator.
pub struct ReconcileGate(pub Arc<ReconcileClient>);

impl BudgetChecker for ReconcileGate {
    fn should_allow(&self) -> bool {
        self.0.should_allow_request()
    }
}

/// Prompt-size heuristic used for quoting: UTF-8 bytes over the
/// pool's bytes_per_token.
pub fn estimate_prompt_tokens(messages: &[ChatMessage], bytes_per_token: u32) -> u64 {
    let bytes: u64 = messages.iter().map(|m| m.content.len() as u64).sum();
    bytes.div_ceil(bytes_per_token.max(1) as u64)
}

// =============================================================================
// TESTS
// =============================================================================
