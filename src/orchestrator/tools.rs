//! Tool Execution Capability
//!
//! The orchestrator holds a `ToolExecutor` and nothing holds a
//! reference back. Implementations own their side effects; the loop
//! only sees JSON in, JSON out.

use crate::providers::ToolSpec;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    UnknownTool(String),
    /// Execution failed; the message is safe to feed back to the
    /// model as an observation.
    Failed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::UnknownTool(name) => write!(f, "unknown tool: {}", name),
            ToolError::Failed(msg) => write!(f, "tool failed: {}", msg),
        }
    }
}

impl std::error::Error for ToolError {}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool surface advertised to the model.
    fn specs(&self) -> Vec<ToolSpec>;

    async fn execute(&self, name: &str, args: &serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// Executor with no tools; plain completions only.
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn specs(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn execute(&self, name: &str, _args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::UnknownTool(name.to_string()))
    }
}
