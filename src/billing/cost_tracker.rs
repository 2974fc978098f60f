//! Streaming Cost Attribution
//!
//! Wraps a completion event channel as a pass-through: events are
//! yielded unchanged while cost state accumulates. At termination the
//! billing method is chosen by fallback:
//!
//! 1. provider_reported: one or more usage events observed; the
//!    terminal one wins.
//! 2. byte_estimated: no usage, but output bytes were seen,
//!    `tokens = ceil(bytes / bytes_per_token)`.
//! 3. prompt_only: nothing observable; bill the prompt estimate.
//!
//! Byte counting is UTF-8 bytes, not code points. An aborted stream
//! still yields a terminal cost.

use crate::billing::money::MicroUsd;
use crate::billing::pricing::PricingEntry;
use crate::providers::stream::{StreamEvent, UsageReport};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// How the terminal cost was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMethod {
    ProviderReported,
    ByteEstimated,
    PromptOnly,
}

impl BillingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMethod::ProviderReported => "provider_reported",
            BillingMethod::ByteEstimated => "byte_estimated",
            BillingMethod::PromptOnly => "prompt_only",
        }
    }
}

/// Terminal cost attribution for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostResult {
    pub method: BillingMethod,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost: MicroUsd,
    pub output_bytes: u64,
    pub was_aborted: bool,
}

/// Overcount multiplier applied to byte-estimated completion tokens
/// by [`CostTracker::overcount_result`], as a ratio.
const OVERCOUNT_NUM: u64 = 11;
const OVERCOUNT_DEN: u64 = 10;

pub struct CostTracker {
    rx: mpsc::Receiver<StreamEvent>,
    pricing: PricingEntry,
    prompt_tokens_estimate: u64,
    usage: Option<UsageReport>,
    output_bytes: u64,
    was_aborted: bool,
    finished: bool,
}

impl CostTracker {
    pub fn new(
        rx: mpsc::Receiver<StreamEvent>,
        pricing: PricingEntry,
        prompt_tokens_estimate: u64,
    ) -> Self {
        CostTracker {
            rx,
            pricing,
            prompt_tokens_estimate,
            usage: None,
            output_bytes: 0,
            was_aborted: false,
            finished: false,
        }
    }

    /// Pull the next event, observing it on the way through. Returns
    /// `None` at stream end (or after abort).
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                self.observe(&event);
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Chunk { delta_text } => {
                self.output_bytes += delta_text.len() as u64;
            }
            StreamEvent::Usage(usage) => {
                // Terminal usage wins: later reports overwrite earlier.
                self.usage = Some(*usage);
            }
            StreamEvent::ToolCall { .. } | StreamEvent::Done | StreamEvent::Error(_) => {}
        }
    }

    /// Record a consumer-side abort. The stream stops yielding and the
    /// result carries `was_aborted = true`.
    pub fn abort(&mut self) {
        self.was_aborted = true;
        self.finished = true;
        self.rx.close();
    }

    pub fn was_aborted(&self) -> bool {
        self.was_aborted
    }

    fn estimated_completion_tokens(&self) -> u64 {
        let bpt = self.pricing.bytes_per_token() as u64;
        self.output_bytes.div_ceil(bpt)
    }

    fn result_from(&self, prompt: u64, completion: u64, reasoning: u64, method: BillingMethod) -> CostResult {
        CostResult {
            method,
            prompt_tokens: prompt,
            completion_tokens: completion,
            reasoning_tokens: reasoning,
            cost: self.pricing.cost(prompt, completion, reasoning),
            output_bytes: self.output_bytes,
            was_aborted: self.was_aborted,
        }
    }

    /// Terminal attribution per the fallback ladder.
    pub fn result(&self) -> CostResult {
        if let Some(usage) = self.usage {
            return self.result_from(
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.reasoning_tokens,
                BillingMethod::ProviderReported,
            );
        }
        if self.output_bytes > 0 {
            return self.result_from(
                self.prompt_tokens_estimate,
                self.estimated_completion_tokens(),
                0,
                BillingMethod::ByteEstimated,
            );
        }
        self.result_from(self.prompt_tokens_estimate, 0, 0, BillingMethod::PromptOnly)
    }

    /// Attribution biased toward the provider: byte-estimated
    /// completion tokens are overcounted by 1.10x (rounded up). When
    /// `usage_on_abort` is set and a usage event was observed, the
    /// usage is applied exactly even on an aborted stream.
    pub fn overcount_result(&self, usage_on_abort: bool) -> CostResult {
        if let Some(usage) = self.usage {
            if !self.was_aborted || usage_on_abort {
                return self.result_from(
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.reasoning_tokens,
                    BillingMethod::ProviderReported,
                );
            }
        }
        if self.output_bytes > 0 {
            let estimated = self.estimated_completion_tokens();
            let overcounted = (estimated * OVERCOUNT_NUM).div_ceil(OVERCOUNT_DEN);
            return self.result_from(
                self.prompt_tokens_estimate,
                overcounted,
                0,
                BillingMethod::ByteEstimated,
            );
        }
        self.result_from(self.prompt_tokens_estimate, 0, 0, BillingMethod::PromptOnly)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stream::event_channel;
    use crate::providers::ProviderError;

    fn pricing() -> PricingEntry {
        PricingEntry {
            pool: "cheap".into(),
            provider: "p".into(),
            model: "m".into(),
            input_price: MicroUsd::from_i64(2_000_000),
            output_price: MicroUsd::from_i64(10_000_000),
            reasoning_price: MicroUsd::from_i64(1_000_000),
            bytes_per_token: Some(4),
        }
    }

    async fn drain(tracker: &mut CostTracker) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = tracker.next().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_byte_estimated_fallback() {
        let (tx, rx) = event_channel(16);
        let mut tracker = CostTracker::new(rx, pricing(), 100);

        // Two chunks totaling 11 UTF-8 bytes, no usage event.
        tx.send(StreamEvent::Chunk { delta_text: "hello ".into() }).await.unwrap();
        tx.send(StreamEvent::Chunk { delta_text: "world".into() }).await.unwrap();
        tx.send(StreamEvent::Done).await.unwrap();
        drop(tx);

        let events = drain(&mut tracker).await;
        assert_eq!(events.len(), 3);

        let result = tracker.result();
        assert_eq!(result.method, BillingMethod::ByteEstimated);
        assert_eq!(result.output_bytes, 11);
        assert_eq!(result.completion_tokens, 3); // ceil(11 / 4)
        // cost = floor(100*p_in/1e6) + floor(3*p_out/1e6)
        assert_eq!(result.cost, MicroUsd::from_i64(200 + 30));
        assert!(!result.was_aborted);
    }

    #[tokio::test]
    async fn test_terminal_usage_wins() {
        let (tx, rx) = event_channel(16);
        let mut tracker = CostTracker::new(rx, pricing(), 100);

        tx.send(StreamEvent::Chunk { delta_text: "hello world".into() }).await.unwrap();
        tx.send(StreamEvent::Usage(UsageReport {
            prompt_tokens: 90,
            completion_tokens: 5,
            reasoning_tokens: 0,
        }))
        .await
        .unwrap();
        tx.send(StreamEvent::Usage(UsageReport {
            prompt_tokens: 97,
            completion_tokens: 12,
            reasoning_tokens: 3,
        }))
        .await
        .unwrap();
        tx.send(StreamEvent::Done).await.unwrap();
        drop(tx);

        drain(&mut tracker).await;
        let result = tracker.result();
        assert_eq!(result.method, BillingMethod::ProviderReported);
        assert_eq!(result.prompt_tokens, 97);
        assert_eq!(result.completion_tokens, 12);
        assert_eq!(result.reasoning_tokens, 3);
        assert_eq!(
            result.cost,
            MicroUsd::from_i64(97 * 2 + 12 * 10 + 3 * 1)
        );
    }

    #[tokio::test]
    async fn test_prompt_only_when_nothing_observed() {
        let (tx, rx) = event_channel(4);
        let mut tracker = CostTracker::new(rx, pricing(), 50);
        tx.send(StreamEvent::Error(ProviderError::Timeout)).await.unwrap();
        drop(tx);

        drain(&mut tracker).await;
        let result = tracker.result();
        assert_eq!(result.method, BillingMethod::PromptOnly);
        assert_eq!(result.prompt_tokens, 50);
        assert_eq!(result.completion_tokens, 0);
        assert_eq!(result.cost, MicroUsd::from_i64(100));
    }

    #[tokio::test]
    async fn test_utf8_bytes_not_code_points() {
        let (tx, rx) = event_channel(4);
        let mut tracker = CostTracker::new(rx, pricing(), 0);
        // Four code points, twelve UTF-8 bytes.
        tx.send(StreamEvent::Chunk { delta_text: "héllo🦀".into() }).await.unwrap();
        tx.send(StreamEvent::Done).await.unwrap();
        drop(tx);

        drain(&mut tracker).await;
        let result = tracker.result();
        assert_eq!(result.output_bytes, "héllo🦀".len() as u64);
        assert_eq!(
            result.completion_tokens,
            ("héllo🦀".len() as u64).div_ceil(4)
        );
    }

    #[tokio::test]
    async fn test_abort_still_produces_terminal_cost() {
        let (tx, rx) = event_channel(16);
        let mut tracker = CostTracker::new(rx, pricing(), 10);
        tx.send(StreamEvent::Chunk { delta_text: "partial".into() }).await.unwrap();

        assert!(tracker.next().await.is_some());
        tracker.abort();
        assert!(tracker.next().await.is_none());

        let result = tracker.result();
        assert!(result.was_aborted);
        assert_eq!(result.method, BillingMethod::ByteEstimated);
        assert_eq!(result.completion_tokens, 2); // ceil(7 / 4)
    }

    #[tokio::test]
    async fn test_overcount_applies_to_byte_estimate_only() {
        let (tx, rx) = event_channel(16);
        let mut tracker = CostTracker::new(rx, pricing(), 10);
        // 40 bytes -> 10 estimated tokens -> 11 overcounted.
        tx.send(StreamEvent::Chunk { delta_text: "x".repeat(40) }).await.unwrap();
        tx.send(StreamEvent::Done).await.unwrap();
        drop(tx);
        drain(&mut tracker).await;

        let plain = tracker.result();
        let over = tracker.overcount_result(false);
        assert_eq!(plain.completion_tokens, 10);
        assert_eq!(over.completion_tokens, 11);
        assert_eq!(over.method, BillingMethod::ByteEstimated);
    }

    #[tokio::test]
    async fn test_overcount_usage_on_abort() {
        let (tx, rx) = event_channel(16);
        let mut tracker = CostTracker::new(rx, pricing(), 10);
        tx.send(StreamEvent::Chunk { delta_text: "some output".into() }).await.unwrap();
        tx.send(StreamEvent::Usage(UsageReport {
            prompt_tokens: 10,
            completion_tokens: 4,
            reasoning_tokens: 0,
        }))
        .await
        .unwrap();

        tracker.next().await;
        tracker.next().await;
        tracker.abort();

        // usage_on_abort=true: exact usage, no overcount.
        let exact = tracker.overcount_result(true);
        assert_eq!(exact.method, BillingMethod::ProviderReported);
        assert_eq!(exact.completion_tokens, 4);
        assert!(exact.was_aborted);

        // usage_on_abort=false: aborted usage is distrusted; fall back
        // to the overcounted byte estimate.
        let estimated = tracker.overcount_result(false);
        assert_eq!(estimated.method, BillingMethod::ByteEstimated);
        assert_eq!(estimated.completion_tokens, 4); // ceil(11/4)=3 -> ceil(3*1.1)=4
    }
}
