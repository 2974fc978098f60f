//! Model Stream Events
//!
//! A model completion is a pull-based event channel: the provider
//! adapter writes events, the consumer reads until `Done`, `Error`,
//! or cancellation. Backpressure is inherent in the pull.

use crate::providers::ProviderError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
}

/// One event on a completion stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental output text.
    Chunk { delta_text: String },
    /// A tool invocation requested by the model.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Usage snapshot. Providers may emit several; the terminal one
    /// wins for billing.
    Usage(UsageReport),
    /// Clean end of stream.
    Done,
    /// Stream ended with a provider error.
    Error(ProviderError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

/// Bounded event channel between a provider adapter and a consumer.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
    mpsc::channel(capacity)
}
