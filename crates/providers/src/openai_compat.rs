//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, xAI Grok, DeepSeek, Ollama, vLLM, LM Studio and any
//! other endpoint that follows the chat completions contract.

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{build_client, from_reqwest, resolve_api_key, status_error, ModelMatcher};
use cs_domain::capability::{is_reasoning_model, LlmCapabilities};
use cs_domain::config::ProviderConfig;
use cs_domain::error::{Error, Result};
use cs_domain::message::{ContentPart, Message, MessageContent, Role};
use cs_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::{json, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    auth_header: String,
    auth_prefix: String,
    default_model: String,
    matcher: ModelMatcher,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new provider from the deserialized provider config.
    pub fn from_config(cfg: &ProviderConfig, timeout_secs: u64) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let auth_header = cfg
            .auth
            .header
            .clone()
            .unwrap_or_else(|| "Authorization".into());
        let auth_prefix = cfg.auth.prefix.clone().unwrap_or_else(|| "Bearer ".into());
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gpt-4o".into());

        let capabilities = LlmCapabilities {
            supports_streaming: true,
            supports_vision: cfg.vision.unwrap_or(true),
            requires_inline_images: false,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            auth_header,
            auth_prefix,
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
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            rb = rb.header(&self.auth_header, format!("{}{}", self.auth_prefix, key));
        }
        rb
    }
}

/// Build the chat completions body for `model`.
fn build_chat_body(model: &str, req: &ChatRequest) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    // o-series: max_completion_tokens, and temperature is rejected.
    if is_reasoning_model(model) {
        if let Some(max) = req.max_tokens {
            body["max_completion_tokens"] = json!(max);
        }
    } else {
        if let Some(temp) = req.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }
    }

    if let Some(effort) = req
        .options
        .grok_options
        .as_ref()
        .and_then(|g| g.reasoning_effort.as_deref())
    {
        body["reasoning_effort"] = json!(effort);
    }

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    let role = role_to_str(msg.role);
    match &msg.content {
        MessageContent::Parts(parts) if msg.role == Role::User && msg.content.has_images() => {
            let content: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::ImageUrl { url } => json!({
                        "type": "image_url",
                        "image_url": { "url": url }
                    }),
                    ContentPart::InlineImage { media_type, data } => json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{media_type};base64,{data}") }
                    }),
                })
                .collect();
            json!({ "role": role, "content": content })
        }
        other => json!({ "role": role, "content": other.extract_all_text() }),
    }
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("prompt_tokens")?.as_u64()? as u32;
    let completion = v.get("completion_tokens").and_then(|c| c.as_u64()).unwrap_or(0) as u32;
    let mut usage = Usage::new(prompt, completion);
    if let Some(total) = v.get("total_tokens").and_then(|t| t.as_u64()) {
        usage.total_tokens = (total as u32).max(usage.total_tokens);
    }
    Some(usage)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `finish_reason` usually arrives one frame before the usage-only frame
/// sent for `include_usage`; hold it until usage shows up (or `[DONE]`).
#[derive(Default)]
struct StreamState {
    finish_reason: Option<String>,
    done_emitted: bool,
}

fn parse_sse_data(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    // Some compatible servers report failures in-band.
    if let Some(msg) = v.pointer("/error/message").and_then(|m| m.as_str()) {
        events.push(Ok(StreamEvent::Error { message: msg.to_string() }));
        return events;
    }

    if let Some(choice) = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    {
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        // DeepSeek and xAI stream their reasoning trace separately.
        for key in ["reasoning_content", "reasoning"] {
            if let Some(text) = delta.get(key).and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    events.push(Ok(StreamEvent::Thinking { text: text.to_string() }));
                }
            }
        }

        if let Some(text) = delta.get("content").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text: text.to_string() }));
            }
        }

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            state.finish_reason = Some(fr.to_string());
        }
    }

    if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
        if !state.done_emitted {
            state.done_emitted = true;
            events.push(Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: state.finish_reason.clone().or_else(|| Some("stop".into())),
            }));
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn supports(&self, model: &str) -> bool {
        self.matcher.matches(model)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = req.model.as_deref().unwrap_or(&self.default_model);
        let body = build_chat_body(self.matcher.wire_model(model), &req);

        tracing::debug!(provider = %self.id, url = %url, model = %model, "openai_compat stream request");

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
            parse_sse_data(data, &mut state)
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
    use crate::traits::{GrokOptions, ProviderOptions};

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user("hello")],
            temperature: Some(0.7),
            max_tokens: Some(512),
            ..Default::default()
        }
    }

    #[test]
    fn reasoning_models_use_max_completion_tokens() {
        let body = build_chat_body("o3-mini", &request());
        assert_eq!(body["max_completion_tokens"], 512);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());

        let body = build_chat_body("gpt-4o", &request());
        assert_eq!(body["max_tokens"], 512);
        assert!(body.get("temperature").is_some());
    }

    #[test]
    fn grok_reasoning_effort_is_forwarded() {
        let mut req = request();
        req.options = ProviderOptions {
            grok_options: Some(GrokOptions {
                reasoning_effort: Some("high".into()),
            }),
            claude_options: None,
        };
        let body = build_chat_body("grok-3-mini", &req);
        assert_eq!(body["reasoning_effort"], "high");
    }

    #[test]
    fn image_parts_are_sent_as_urls() {
        let req = ChatRequest {
            messages: vec![Message::user_parts(vec![
                ContentPart::Text { text: "describe".into() },
                ContentPart::ImageUrl { url: "https://x/cat.png".into() },
            ])],
            ..Default::default()
        };
        let body = build_chat_body("gpt-4o", &req);
        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "https://x/cat.png");
    }

    #[test]
    fn stream_holds_finish_reason_until_usage() {
        let mut state = StreamState::default();
        let mut events = Vec::new();
        for frame in [
            r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        ] {
            events.extend(parse_sse_data(frame, &mut state).into_iter().map(|e| e.unwrap()));
        }
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "hmm"));
        assert!(matches!(&events[2], StreamEvent::Token { text } if text == "lo"));
        match &events[3] {
            StreamEvent::Done { usage, finish_reason } => {
                assert_eq!(*usage, Some(Usage::new(5, 2)));
                assert_eq!(finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn in_band_error_is_reported() {
        let mut state = StreamState::default();
        let events = parse_sse_data(r#"{"error":{"message":"rate limited"}}"#, &mut state);
        assert!(matches!(&events[0], Ok(StreamEvent::Error { message }) if message == "rate limited"));
    }
}
