use cs_domain::capability::LlmCapabilities;
use cs_domain::error::Result;
use cs_domain::message::Message;
use cs_domain::stream::{BoxStream, StreamEvent};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic streaming chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 – 2.0). `None` lets the provider choose.
    /// Reasoning models never receive it.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier. When `None`, the provider uses its default.
    pub model: Option<String>,
    /// Provider-specific knobs passed through from the client.
    pub options: ProviderOptions,
}

/// Per-family options a client may attach to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_options: Option<ClaudeOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_options: Option<GrokOptions>,
}

/// Anthropic extended thinking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeOptions {
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

/// xAI reasoning effort (`low` | `high`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrokOptions {
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// Implementations translate between our internal types and the wire format
/// of one provider family's HTTP API.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Whether this provider serves `model`. The registry asks providers in
    /// configured order and routes to the first that answers `true`.
    fn supports(&self, model: &str) -> bool;

    /// Send a chat request and return a stream of decoded events.
    ///
    /// Errors returned here happen before the first byte of the body
    /// (connect failure, non-2xx status).
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// The advertised capabilities of this provider.
    fn capabilities(&self) -> &LlmCapabilities;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
