//! Completion Orchestrator
//!
//! Drives the multi-step tool-call loop for one billed request. The
//! orchestrator holds four capabilities and nothing holds a reference
//! back to it: a `Model` to complete against, a `ToolExecutor` for
//! side effects, an `IdempotencyCache` for replayed tool calls, and
//! an optional `BudgetChecker` consulted before each iteration.
//!
//! Every bound is explicit: iterations, total tool calls, wall time,
//! and consecutive tool failures. Exceeding any of them aborts the
//! loop with a typed error.

pub mod idempotency;
pub mod tools;

pub use idempotency::IdempotencyCache;
pub use tools::{NoTools, ToolError, ToolExecutor};

use crate::providers::{ChatMessage, ProviderError, ToolSpec, UsageReport};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A tool invocation requested by the model. Arguments arrive as the
/// raw string the model produced; parsing happens in the loop so
/// malformed arguments become observations, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One model completion turn.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: Option<UsageReport>,
}

/// Capability: one completion turn against the routed pool.
#[async_trait]
pub trait Model: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, ProviderError>;
}

/// Capability: admission gate consulted at each iteration.
pub trait BudgetChecker: Send + Sync {
    fn should_allow(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct OrchestratorLimits {
    pub max_iterations: u32,
    pub max_total_tool_calls: u32,
    pub max_wall_time: Duration,
    pub abort_on_consecutive_failures: u32,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        OrchestratorLimits {
            max_iterations: 8,
            max_total_tool_calls: 32,
            max_wall_time: Duration::from_secs(120),
            abort_on_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    MaxIterationsExceeded { limit: u32 },
    MaxToolCallsExceeded { limit: u32 },
    WallTimeExceeded { limit_ms: u64 },
    ConsecutiveToolFailures { count: u32 },
    BudgetDenied,
    Cancelled,
    Provider(ProviderError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::MaxIterationsExceeded { limit } => {
                write!(f, "tool loop exceeded {} iterations", limit)
            }
            OrchestratorError::MaxToolCallsExceeded { limit } => {
                write!(f, "tool loop exceeded {} total tool calls", limit)
            }
            OrchestratorError::WallTimeExceeded { limit_ms } => {
                write!(f, "tool loop exceeded {} ms wall time", limit_ms)
            }
            OrchestratorError::ConsecutiveToolFailures { count } => {
                write!(f, "{} consecutive tool failures", count)
            }
            OrchestratorError::BudgetDenied => write!(f, "budget checker denied admission"),
            OrchestratorError::Cancelled => write!(f, "loop cancelled"),
            OrchestratorError::Provider(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<ProviderError> for OrchestratorError {
    fn from(e: ProviderError) -> Self {
        OrchestratorError::Provider(e)
    }
}

/// Loop observability events.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    IterationStart { iteration: u32 },
    ToolRequested { iteration: u32, name: String, id: String },
    ToolExecuted { iteration: u32, name: String, id: String, cached: bool, ok: bool },
    IterationComplete { iteration: u32, tool_calls: u32 },
    LoopComplete { iterations: u32, total_tool_calls: u32 },
}

/// Final loop result.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub final_text: String,
    pub iterations: u32,
    pub total_tool_calls: u32,
    /// Usage summed over every completion turn.
    pub usage_total: UsageReport,
    pub messages: Vec<ChatMessage>,
}

type EventSink = Box<dyn Fn(LoopEvent) + Send + Sync>;

pub struct Orchestrator {
    model: Arc<dyn Model>,
    tools: Arc<dyn ToolExecutor>,
    cache: Arc<IdempotencyCache>,
    budget: Option<Arc<dyn BudgetChecker>>,
    limits: OrchestratorLimits,
    on_event: Option<EventSink>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn Model>,
        tools: Arc<dyn ToolExecutor>,
        cache: Arc<IdempotencyCache>,
        limits: OrchestratorLimits,
    ) -> Self {
        Orchestrator {
            model,
            tools,
            cache,
            budget: None,
            limits,
            on_event: None,
        }
    }

    pub fn with_budget_checker(mut self, budget: Arc<dyn BudgetChecker>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.on_event = Some(sink);
        self
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(sink) = &self.on_event {
            sink(event);
        }
    }

    /// Run the loop to completion. `cancel` aborts between suspension
    /// points; an in-flight tool execution runs to completion but its
    /// result is discarded.
    pub async fn run(
        &self,
        trace_id: &str,
        mut messages: Vec<ChatMessage>,
        cancel: Arc<AtomicBool>,
    ) -> Result<LoopOutcome, OrchestratorError> {
        let started = Instant::now();
        let specs = self.tools.specs();
        let mut usage_total = UsageReport::default();
        let mut total_tool_calls = 0u32;
        let mut consecutive_failures = 0u32;

        for iteration in 1..=self.limits.max_iterations {
            self.emit(LoopEvent::IterationStart { iteration });

            if cancel.load(Ordering::SeqCst) {
                return Err(OrchestratorError::Cancelled);
            }
            if started.elapsed() > self.limits.max_wall_time {
                return Err(OrchestratorError::WallTimeExceeded {
                    limit_ms: self.limits.max_wall_time.as_millis() as u64,
                });
            }
            if let Some(budget) = &self.budget {
                if !budget.should_allow() {
                    return Err(OrchestratorError::BudgetDenied);
                }
            }

            let completion = self.model.complete(&messages, &specs).await?;
            if let Some(usage) = completion.usage {
                usage_total.prompt_tokens += usage.prompt_tokens;
                usage_total.completion_tokens += usage.completion_tokens;
                usage_total.reasoning_tokens += usage.reasoning_tokens;
            }

            if completion.tool_calls.is_empty() {
                self.emit(LoopEvent::LoopComplete {
                    iterations: iteration,
                    total_tool_calls,
                });
                messages.push(ChatMessage::assistant(completion.text.clone()));
                return Ok(LoopOutcome {
                    final_text: completion.text,
                    iterations: iteration,
                    total_tool_calls,
                    usage_total,
                    messages,
                });
            }

            if !completion.text.is_empty() {
                messages.push(ChatMessage::assistant(completion.text.clone()));
            }

            let calls_this_iteration = completion.tool_calls.len() as u32;
            for call in completion.tool_calls {
                total_tool_calls += 1;
                if total_tool_calls > self.limits.max_total_tool_calls {
                    return Err(OrchestratorError::MaxToolCallsExceeded {
                        limit: self.limits.max_total_tool_calls,
                    });
                }
                self.emit(LoopEvent::ToolRequested {
                    iteration,
                    name: call.name.clone(),
                    id: call.id.clone(),
                });

                let observation = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                    Err(e) => {
                        // Malformed arguments are an observation the
                        // model can correct, not a loop error.
                        debug!(tool = %call.name, error = %e, "malformed tool arguments");
                        consecutive_failures += 1;
                        self.emit(LoopEvent::ToolExecuted {
                            iteration,
                            name: call.name.clone(),
                            id: call.id.clone(),
                            cached: false,
                            ok: false,
                        });
                        serde_json::json!({
                            "error": "invalid_arguments",
                            "message": format!("arguments were not valid JSON: {}", e),
                        })
                    }
                    Ok(args) => {
                        let key = IdempotencyCache::key(trace_id, &call.name, &args);
                        if let Some(cached) = self.cache.get(&key) {
                            consecutive_failures = 0;
                            self.emit(LoopEvent::ToolExecuted {
                                iteration,
                                name: call.name.clone(),
                                id: call.id.clone(),
                                cached: true,
                                ok: true,
                            });
                            cached
                        } else {
                            let result = self.tools.execute(&call.name, &args).await;
                            if cancel.load(Ordering::SeqCst) {
                                // Ran to completion, result discarded.
                                return Err(OrchestratorError::Cancelled);
                            }
                            match result {
                                Ok(value) => {
                                    self.cache.put(key, value.clone());
                                    consecutive_failures = 0;
                                    self.emit(LoopEvent::ToolExecuted {
                                        iteration,
                                        name: call.name.clone(),
                                        id: call.id.clone(),
                                        cached: false,
                                        ok: true,
                                    });
                                    value
                                }
                                Err(e) => {
                                    consecutive_failures += 1;
                                    self.emit(LoopEvent::ToolExecuted {
                                        iteration,
                                        name: call.name.clone(),
                                        id: call.id.clone(),
                                        cached: false,
                                        ok: false,
                                    });
                                    serde_json::json!({
                                        "error": "tool_failed",
                                        "message": e.to_string(),
                                    })
                                }
                            }
                        }
                    }
                };

                if consecutive_failures >= self.limits.abort_on_consecutive_failures {
                    warn!(
                        trace_id = trace_id,
                        failures = consecutive_failures,
                        "aborting tool loop on consecutive failures"
                    );
                    return Err(OrchestratorError::ConsecutiveToolFailures {
                        count: consecutive_failures,
                    });
                }

                messages.push(ChatMessage::tool(call.id.clone(), observation.to_string()));
            }

            self.emit(LoopEvent::IterationComplete {
                iteration,
                tool_calls: calls_this_iteration,
            });
        }

        Err(OrchestratorError::MaxIterationsExceeded {
            limit: self.limits.max_iterations,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
