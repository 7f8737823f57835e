//! Anthropic-native adapter.
//!
//! Implements the streaming Messages API. System messages go in the separate
//! top-level `system` field; images must be embedded as base64; extended
//! thinking is surfaced as `Thinking` events.

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{build_client, from_reqwest, resolve_api_key, status_error, ModelMatcher};
use cs_domain::capability::LlmCapabilities;
use cs_domain::config::ProviderConfig;
use cs_domain::error::{Error, Result};
use cs_domain::message::{ContentPart, Message, MessageContent, Role};
use cs_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::{json, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_THINKING_BUDGET: u32 = 10_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    matcher: ModelMatcher,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new provider from the deserialized provider config.
    pub fn from_config(cfg: &ProviderConfig, timeout_secs: u64) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let default_model = cfg
            .default_model
            .clone()
            .unwrap_or_else(|| "claude-sonnet-4-20250514".into());

        let capabilities = LlmCapabilities {
            supports_streaming: true,
            supports_vision: cfg.vision.unwrap_or(true),
            requires_inline_images: true,
            context_window_tokens: Some(200_000),
            max_output_tokens: Some(8_192),
        };

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            matcher: ModelMatcher::from_config(cfg),
            capabilities,
            client: build_client(timeout_secs)?,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            rb = rb.header("x-api-key", key);
        }
        rb
    }

    fn build_messages_body(&self, req: &ChatRequest) -> Value {
        let model = req.model.as_deref().unwrap_or(&self.default_model);
        build_messages_body(self.matcher.wire_model(model), req)
    }
}

fn build_messages_body(model: &str, req: &ChatRequest) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut api_messages: Vec<Value> = Vec::new();

    for msg in &req.messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.extract_all_text()),
            Role::User => api_messages.push(msg_to_anthropic("user", msg)),
            Role::Assistant => api_messages.push(msg_to_anthropic("assistant", msg)),
        }
    }

    let mut body = json!({
        "model": model,
        "messages": api_messages,
        "stream": true,
    });

    if !system_parts.is_empty() {
        body["system"] = Value::String(system_parts.join("\n\n"));
    }

    let mut max_tokens = req.max_tokens.unwrap_or(4096);
    let thinking = req.options.claude_options.as_ref().filter(|o| o.thinking);
    match thinking {
        Some(opts) => {
            // Extended thinking rejects custom temperature and needs room
            // for the answer beyond the thinking budget.
            let budget = opts.thinking_budget.unwrap_or(DEFAULT_THINKING_BUDGET).max(1024);
            max_tokens = max_tokens.max(budget + 1024);
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        None => {
            if let Some(temp) = req.temperature {
                body["temperature"] = json!(temp);
            }
        }
    }
    body["max_tokens"] = json!(max_tokens);

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_anthropic(role: &str, msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => json!({ "role": role, "content": t }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::InlineImage { media_type, data } => json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": data,
                        }
                    }),
                    ContentPart::ImageUrl { url } => json!({
                        "type": "image",
                        "source": { "type": "url", "url": url }
                    }),
                })
                .collect();
            json!({ "role": role, "content": content })
        }
    }
}

fn parse_anthropic_usage(v: &Value) -> Usage {
    let input = v.get("input_tokens").and_then(|x| x.as_u64()).unwrap_or(0) as u32;
    let output = v.get("output_tokens").and_then(|x| x.as_u64()).unwrap_or(0) as u32;
    Usage::new(input, output)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StreamState {
    /// Input tokens arrive in `message_start`, output tokens at the end.
    usage: Usage,
    done_emitted: bool,
}

/// Parse one Anthropic SSE data payload.
fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(u) = v.pointer("/message/usage") {
                state.usage.merge(&parse_anthropic_usage(u));
            }
        }

        "content_block_delta" => {
            let Some(delta) = v.get("delta") else {
                return events;
            };
            match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(Ok(StreamEvent::Token { text: text.to_string() }));
                        }
                    }
                }
                "thinking_delta" => {
                    if let Some(text) = delta.get("thinking").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(Ok(StreamEvent::Thinking { text: text.to_string() }));
                        }
                    }
                }
                // signature_delta and anything newer carry no visible text.
                _ => {}
            }
        }

        "message_delta" => {
            if let Some(u) = v.get("usage") {
                state.usage.merge(&parse_anthropic_usage(u));
            }
            let stop_reason = v
                .pointer("/delta/stop_reason")
                .and_then(|s| s.as_str())
                .map(|s| match s {
                    "end_turn" => "stop".to_string(),
                    other => other.to_string(),
                });
            if stop_reason.is_some() && !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: Some(state.usage),
                    finish_reason: stop_reason,
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: Some(state.usage),
                    finish_reason: Some("stop".into()),
                }));
            }
        }

        "error" => {
            let msg = v
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error { message: msg.to_string() }));
        }

        // ping, content_block_start/stop
        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn supports(&self, model: &str) -> bool {
        self.matcher.matches(model)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req);

        tracing::debug!(provider = %self.id, url = %url, "anthropic stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(status_error(&self.id, resp).await);
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_anthropic_sse(data, &mut state)
        }))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ClaudeOptions, ProviderOptions};

    fn feed(state: &mut StreamState, frames: &[&str]) -> Vec<StreamEvent> {
        frames
            .iter()
            .flat_map(|f| parse_anthropic_sse(f, state))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn stream_yields_text_thinking_and_usage() {
        let mut state = StreamState::default();
        let events = feed(
            &mut state,
            &[
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me see."}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hi"}}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "Let me see."));
        assert!(matches!(&events[1], StreamEvent::Token { text } if text == "Hi"));
        match &events[2] {
            StreamEvent::Done { usage, finish_reason } => {
                assert_eq!(*usage, Some(Usage::new(12, 7)));
                assert_eq!(finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_becomes_error_event() {
        let mut state = StreamState::default();
        let events = feed(
            &mut state,
            &[r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#],
        );
        assert!(matches!(&events[0], StreamEvent::Error { message } if message == "Overloaded"));
    }

    #[test]
    fn extended_thinking_drops_temperature_and_raises_max_tokens() {
        let req = ChatRequest {
            messages: vec![Message::system("be brief"), Message::user("hi")],
            temperature: Some(0.7),
            max_tokens: Some(1000),
            options: ProviderOptions {
                claude_options: Some(ClaudeOptions {
                    thinking: true,
                    thinking_budget: Some(4000),
                }),
                grok_options: None,
            },
            ..Default::default()
        };
        let body = build_messages_body("claude-sonnet-4-20250514", &req);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["thinking"]["budget_tokens"], 4000);
        assert_eq!(body["max_tokens"], 5024);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn inline_images_become_base64_sources() {
        let req = ChatRequest {
            messages: vec![Message::user_parts(vec![
                ContentPart::Text { text: "what is this".into() },
                ContentPart::InlineImage {
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                },
            ])],
            ..Default::default()
        };
        let body = build_messages_body("claude-3-5-sonnet-latest", &req);
        let block = &body["messages"][0]["content"][1];
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
    }
}
