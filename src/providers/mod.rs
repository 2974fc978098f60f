//! Model Provider Adapters
//!
//! Capability seam between the orchestrator and the upstream model
//! pools. A provider turns a completion request into a stream of
//! events; failures carry a taxonomy so the circuit breaker can
//! separate infrastructure health from domain rejections.

pub mod circuit_breaker;
pub mod http_adapter;
pub mod stream;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use http_adapter::{HttpModelProvider, HttpProviderConfig};
pub use stream::{event_channel, StreamEvent, UsageReport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Chat roles on the provider wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Tool surface advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request for one streamed completion against a pool's model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_output_tokens: u64,
}

/// Provider failure taxonomy.
///
/// Only *health failures* (connection refused, timeout, 5xx) count
/// toward opening the circuit breaker. Rate limits, auth failures,
/// and other 4xx are the provider working as designed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    ConnectionRefused,
    Timeout,
    Http { status: u16 },
    RateLimited,
    AuthError,
    /// Response arrived but did not parse.
    Malformed(String),
}

impl ProviderError {
    pub fn is_health_failure(&self) -> bool {
        match self {
            ProviderError::ConnectionRefused | ProviderError::Timeout => true,
            ProviderError::Http { status } => *status >= 500,
            ProviderError::RateLimited
            | ProviderError::AuthError
            | ProviderError::Malformed(_) => false,
        }
    }

    /// Finalize failures with these causes go to the DLQ.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::ConnectionRefused | ProviderError::Timeout => true,
            ProviderError::Http { status } => *status >= 500,
            ProviderError::RateLimited => true,
            ProviderError::AuthError | ProviderError::Malformed(_) => false,
        }
    }

    /// Stable code surfaced to callers. Provider error bodies are
    /// never leaked.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::ConnectionRefused => "provider_unreachable",
            ProviderError::Timeout => "provider_timeout",
            ProviderError::Http { status } if *status >= 500 => "provider_unavailable",
            ProviderError::Http { .. } => "provider_rejected",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::AuthError => "auth_error",
            ProviderError::Malformed(_) => "provider_malformed",
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::ConnectionRefused => write!(f, "connection refused"),
            ProviderError::Timeout => write!(f, "request timed out"),
            ProviderError::Http { status } => write!(f, "upstream returned status {}", status),
            ProviderError::RateLimited => write!(f, "upstream rate limited"),
            ProviderError::AuthError => write!(f, "upstream rejected credentials"),
            ProviderError::Malformed(msg) => write!(f, "malformed upstream response: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Capability: open a completion stream. Cancellation is dropping the
/// receiver; adapters observe the closed channel and unwind the HTTP
/// request.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError>;
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_failure_taxonomy() {
        assert!(ProviderError::ConnectionRefused.is_health_failure());
        assert!(ProviderError::Timeout.is_health_failure());
        assert!(ProviderError::Http { status: 503 }.is_health_failure());
        assert!(ProviderError::Http { status: 500 }.is_health_failure());

        assert!(!ProviderError::Http { status: 400 }.is_health_failure());
        assert!(!ProviderError::Http { status: 401 }.is_health_failure());
        assert!(!ProviderError::Http { status: 403 }.is_health_failure());
        assert!(!ProviderError::Http { status: 404 }.is_health_failure());
        assert!(!ProviderError::Http { status: 429 }.is_health_failure());
        assert!(!ProviderError::RateLimited.is_health_failure());
        assert!(!ProviderError::AuthError.is_health_failure());
    }

    #[test]
    fn test_stable_codes_do_not_leak_bodies() {
        let err = ProviderError::Malformed("secret upstream payload".into());
        assert_eq!(err.code(), "provider_malformed");
        assert_eq!(ProviderError::Http { status: 502 }.code(), "provider_unavailable");
    }
}
