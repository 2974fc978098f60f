//! OpenAI-Compatible Streaming Adapter
//!
//! Talks to an OpenAI-style `/chat/completions` endpoint with
//! `stream: true` and translates the SSE frames into [`StreamEvent`]s
//! on a bounded channel. HTTP statuses map onto the provider error
//! taxonomy; a dropped receiver cancels the in-flight request.

use crate::providers::stream::{event_channel, StreamEvent, UsageReport};
use crate::providers::{ChatMessage, CompletionRequest, ModelProvider, ProviderError, Role};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

pub struct HttpModelProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpModelProvider {
    pub fn new(config: HttpProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(HttpModelProvider { client, config })
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn request_body(request: &CompletionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m: &ChatMessage| {
                let mut v = json!({
                    "role": Self::role_str(m.role),
                    "content": m.content,
                });
                if let Some(id) = &m.tool_call_id {
                    v["tool_call_id"] = json!(id);
                }
                v
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_output_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        body
    }

    fn map_status(status: u16) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited,
            401 | 403 => ProviderError::AuthError,
            s => ProviderError::Http { status: s },
        }
    }
}

// SSE chunk shapes, narrowed to what billing and the loop need.

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    usage: Option<SseUsage>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Debug, Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<SseToolCall>,
}

#[derive(Debug, Deserialize)]
struct SseToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<SseFunction>,
}

#[derive(Debug, Deserialize)]
struct SseFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    reasoning_tokens: u64,
}

/// One `data:` payload -> events. `[DONE]` maps to `Done`.
fn parse_sse_data(data: &str) -> Vec<StreamEvent> {
    if data.trim() == "[DONE]" {
        return vec![StreamEvent::Done];
    }
    let chunk: SseChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "undecodable sse chunk");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::Chunk {
                    delta_text: content,
                });
            }
        }
        for call in choice.delta.tool_calls {
            events.push(StreamEvent::ToolCall {
                index: call.index,
                id: call.id.unwrap_or_default(),
                name: call
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default(),
                arguments: call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.clone())
                    .unwrap_or_default(),
            });
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(UsageReport {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            reasoning_tokens: usage.reasoning_tokens,
        }));
    }
    events
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&Self::request_body(&request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::ConnectionRefused
                }
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(Self::map_status(status));
        }

        let (tx, rx) = event_channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            let mut saw_terminal = false;

            'outer: while let Some(frame) = body.next().await {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "model stream interrupted");
                        let _ = tx
                            .send(StreamEvent::Error(if e.is_timeout() {
                                ProviderError::Timeout
                            } else {
                                ProviderError::ConnectionRefused
                            }))
                            .await;
                        saw_terminal = true;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    for event in parse_sse_data(data.trim_start()) {
                        let terminal = event.is_terminal();
                        if tx.send(event).await.is_err() {
                            // Receiver dropped: consumer cancelled.
                            break 'outer;
                        }
                        if terminal {
                            saw_terminal = true;
                            break 'outer;
                        }
                    }
                }
            }

            if !saw_terminal {
                let _ = tx.send(StreamEvent::Done).await;
            }
        });

        Ok(rx)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_chunk() {
        let events = parse_sse_data(
            r#"{"choices":[{"delta":{"content":"hello"}}]}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Chunk { delta_text } if delta_text == "hello"
        ));
    }

    #[test]
    fn test_parse_tool_call_chunk() {
        let events = parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"id\":7}"}}]}}]}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCall { index, id, name, arguments } => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "lookup");
                assert_eq!(arguments, r#"{"id":7}"#);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_usage_frame() {
        let events = parse_sse_data(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34,"reasoning_tokens":5}}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Usage(UsageReport {
                prompt_tokens: 12,
                completion_tokens: 34,
                reasoning_tokens: 5,
            })
        ));
    }

    #[test]
    fn test_parse_done_sentinel() {
        let events = parse_sse_data("[DONE]");
        assert!(matches!(events[0], StreamEvent::Done));
    }

    #[test]
    fn test_garbage_frame_is_skipped() {
        assert!(parse_sse_data("{not json").is_empty());
    }

    #[test]
    fn test_status_taxonomy_mapping() {
        assert_eq!(HttpModelProvider::map_status(429), ProviderError::RateLimited);
        assert_eq!(HttpModelProvider::map_status(401), ProviderError::AuthError);
        assert_eq!(HttpModelProvider::map_status(403), ProviderError::AuthError);
        assert_eq!(
            HttpModelProvider::map_status(503),
            ProviderError::Http { status: 503 }
        );
    }
}
