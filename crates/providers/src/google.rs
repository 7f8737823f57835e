//! Google Gemini adapter.
//!
//! Implements `streamGenerateContent?alt=sse`. Images must be embedded as
//! `inlineData`; thought summaries (`"thought": true` parts) are surfaced as
//! `Thinking` events.

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{build_client, from_reqwest, resolve_api_key, status_error, ModelMatcher};
use cs_domain::capability::LlmCapabilities;
use cs_domain::config::ProviderConfig;
use cs_domain::error::{Error, Result};
use cs_domain::message::{ContentPart, MessageContent, Role};
use cs_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::{json, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for the Google Gemini API.
pub struct GoogleProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    matcher: ModelMatcher,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl GoogleProvider {
    /// Create a new provider from the deserialized provider config.
    pub fn from_config(cfg: &ProviderConfig, timeout_secs: u64) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let default_model = cfg
            .default_model
            .clone()
            .unwrap_or_else(|| "gemini-2.0-flash".into());

        let capabilities = LlmCapabilities {
            supports_streaming: true,
            supports_vision: cfg.vision.unwrap_or(true),
            requires_inline_images: true,
            context_window_tokens: Some(1_000_000),
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

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        )
    }
}

fn build_body(model: &str, req: &ChatRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_texts: Vec<String> = Vec::new();

    for msg in &req.messages {
        let role = match msg.role {
            Role::System => {
                system_texts.push(msg.content.extract_all_text());
                continue;
            }
            Role::User => "user",
            Role::Assistant => "model",
        };
        contents.push(json!({
            "role": role,
            "parts": content_to_gemini_parts(&msg.content),
        }));
    }

    let mut body = json!({ "contents": contents });

    if !system_texts.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system_texts.join("\n\n") }] });
    }

    let mut gen_config = json!({});
    if let Some(temp) = req.temperature {
        gen_config["temperature"] = json!(temp);
    }
    if let Some(max) = req.max_tokens {
        gen_config["maxOutputTokens"] = json!(max);
    }
    if model.starts_with("gemini-2.5") {
        gen_config["thinkingConfig"] = json!({ "includeThoughts": true });
    }
    if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
        body["generationConfig"] = gen_config;
    }

    body
}

fn content_to_gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(t) => vec![json!({ "text": t })],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => json!({ "text": text }),
                ContentPart::InlineImage { media_type, data } => json!({
                    "inlineData": { "mimeType": media_type, "data": data }
                }),
                ContentPart::ImageUrl { url } => json!({
                    "fileData": { "fileUri": url }
                }),
            })
            .collect(),
    }
}

fn parse_gemini_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("promptTokenCount")?.as_u64()? as u32;
    let candidates = v.get("candidatesTokenCount").and_then(|c| c.as_u64()).unwrap_or(0);
    let thoughts = v.get("thoughtsTokenCount").and_then(|c| c.as_u64()).unwrap_or(0);
    Some(Usage::new(prompt, (candidates + thoughts) as u32))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gemini repeats `usageMetadata` on every frame; the last one wins.
#[derive(Default)]
struct StreamState {
    usage: Option<Usage>,
}

fn parse_gemini_sse_data(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    if let Some(msg) = v.pointer("/error/message").and_then(|m| m.as_str()) {
        events.push(Ok(StreamEvent::Error { message: msg.to_string() }));
        return events;
    }

    if let Some(u) = v.get("usageMetadata").and_then(parse_gemini_usage) {
        state.usage = Some(u);
    }

    let Some(candidate) = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    else {
        // A prompt blocked by safety filters has no candidates.
        if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(|r| r.as_str()) {
            events.push(Ok(StreamEvent::Error {
                message: format!("prompt blocked: {reason}"),
            }));
        }
        return events;
    };

    if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
        for part in parts {
            let Some(text) = part.get("text").and_then(|t| t.as_str()) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            let is_thought = part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false);
            events.push(Ok(if is_thought {
                StreamEvent::Thinking { text: text.to_string() }
            } else {
                StreamEvent::Token { text: text.to_string() }
            }));
        }
    }

    if let Some(fr) = candidate.get("finishReason").and_then(|f| f.as_str()) {
        let finish_reason = match fr {
            "STOP" => "stop".to_string(),
            "MAX_TOKENS" => "length".to_string(),
            other => other.to_lowercase(),
        };
        events.push(Ok(StreamEvent::Done {
            usage: state.usage,
            finish_reason: Some(finish_reason),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for GoogleProvider {
    fn supports(&self, model: &str) -> bool {
        self.matcher.matches(model)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = self
            .matcher
            .wire_model(req.model.as_deref().unwrap_or(&self.default_model))
            .to_string();
        let url = self.stream_url(&model);
        let body = build_body(&model, &req);

        tracing::debug!(provider = %self.id, url = %url, "google stream request");

        let mut rb = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            rb = rb.header("x-goog-api-key", key);
        }
        let resp = rb.json(&body).send().await.map_err(from_reqwest)?;

        if !resp.status().is_success() {
            return Err(status_error(&self.id, resp).await);
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_gemini_sse_data(data, &mut state)
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
    use cs_domain::message::Message;

    #[test]
    fn thought_parts_become_thinking() {
        let mut state = StreamState::default();
        let events: Vec<StreamEvent> = parse_gemini_sse_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"pondering","thought":true},{"text":"Answer"}]}}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1}}"#,
            &mut state,
        )
        .into_iter()
        .map(|e| e.unwrap())
        .collect();
        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "pondering"));
        assert!(matches!(&events[1], StreamEvent::Token { text } if text == "Answer"));
        assert_eq!(state.usage, Some(Usage::new(3, 1)));
    }

    #[test]
    fn finish_reason_carries_latest_usage() {
        let mut state = StreamState::default();
        parse_gemini_sse_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"}]}}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1}}"#,
            &mut state,
        );
        let events = parse_gemini_sse_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"b"}]},"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":9}}"#,
            &mut state,
        );
        match events.last().unwrap().as_ref().unwrap() {
            StreamEvent::Done { usage, finish_reason } => {
                assert_eq!(*usage, Some(Usage::new(3, 9)));
                assert_eq!(finish_reason.as_deref(), Some("length"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn body_puts_system_in_system_instruction_and_images_inline() {
        let req = ChatRequest {
            messages: vec![
                Message::system("sys"),
                Message::user_parts(vec![ContentPart::InlineImage {
                    media_type: "image/jpeg".into(),
                    data: "QUJD".into(),
                }]),
                Message::assistant("ok"),
            ],
            ..Default::default()
        };
        let body = build_body("gemini-2.0-flash", &req);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(body["contents"][1]["role"], "model");
        assert!(body.get("generationConfig").is_none());
    }
}
