use serde::{Deserialize, Serialize};

/// LLM model capabilities. Every provider advertises these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCapabilities {
    pub supports_streaming: bool,
    pub supports_vision: bool,
    /// Images must be sent as embedded base64 bytes (no remote URLs).
    pub requires_inline_images: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for LlmCapabilities {
    fn default() -> Self {
        Self {
            supports_streaming: false,
            supports_vision: false,
            requires_inline_images: false,
            context_window_tokens: None,
            max_output_tokens: None,
        }
    }
}

/// Provider family a model belongs to.
///
/// Used for UX flavour (scripted thinking phases) and for per-family
/// request quirks. Resolution is by model-name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Anthropic,
    OpenAi,
    /// OpenAI o-series reasoning models.
    OpenAiReasoning,
    Google,
    Xai,
    DeepSeek,
    Generic,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        let m = m.rsplit('/').next().unwrap_or(&m);
        if m.starts_with("claude") {
            ModelFamily::Anthropic
        } else if is_reasoning_model(m) {
            ModelFamily::OpenAiReasoning
        } else if m.starts_with("gpt") || m.starts_with("chatgpt") {
            ModelFamily::OpenAi
        } else if m.starts_with("gemini") {
            ModelFamily::Google
        } else if m.starts_with("grok") {
            ModelFamily::Xai
        } else if m.starts_with("deepseek") {
            ModelFamily::DeepSeek
        } else {
            ModelFamily::Generic
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Anthropic => "anthropic",
            ModelFamily::OpenAi => "openai",
            ModelFamily::OpenAiReasoning => "openai_reasoning",
            ModelFamily::Google => "google",
            ModelFamily::Xai => "xai",
            ModelFamily::DeepSeek => "deepseek",
            ModelFamily::Generic => "generic",
        }
    }
}

/// OpenAI o-series models take `max_completion_tokens` and reject
/// `temperature`.
pub fn is_reasoning_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    let m = m.rsplit('/').next().unwrap_or(&m);
    ["o1", "o3", "o4"]
        .iter()
        .any(|p| m == *p || m.starts_with(&format!("{p}-")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_by_prefix() {
        assert_eq!(ModelFamily::of("claude-sonnet-4-20250514"), ModelFamily::Anthropic);
        assert_eq!(ModelFamily::of("gpt-4o"), ModelFamily::OpenAi);
        assert_eq!(ModelFamily::of("o3-mini"), ModelFamily::OpenAiReasoning);
        assert_eq!(ModelFamily::of("gemini-2.0-flash"), ModelFamily::Google);
        assert_eq!(ModelFamily::of("grok-3-mini"), ModelFamily::Xai);
        assert_eq!(ModelFamily::of("deepseek/deepseek-reasoner"), ModelFamily::DeepSeek);
        assert_eq!(ModelFamily::of("llama3"), ModelFamily::Generic);
    }

    #[test]
    fn reasoning_detection_does_not_match_lookalikes() {
        assert!(is_reasoning_model("o1"));
        assert!(is_reasoning_model("o4-mini"));
        assert!(!is_reasoning_model("omni-moderation"));
        assert!(!is_reasoning_model("gpt-4o"));
    }
}
