use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pricing::ModelPrice;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider system
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Per-request HTTP timeout for provider calls.
    #[serde(default = "d_120")]
    pub request_timeout_secs: u64,
    /// Default `max_tokens` when a request does not set one.
    #[serde(default = "d_4096")]
    pub max_output_tokens: u32,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    /// Startup policy for LLM providers.
    ///
    /// - `allow_none` (default): the gateway boots with zero providers;
    ///   execution endpoints fail validation until one is configured.
    /// - `require_one`: abort startup if no provider initializes.
    #[serde(default)]
    pub startup_policy: LlmStartupPolicy,
    /// Models a client may request. Entries ending in `*` match by prefix.
    /// Empty means every model some provider supports.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Registered LLM providers, tried in order when resolving a model.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Price overrides (key = model prefix, e.g. "gpt-4o").
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            max_output_tokens: 4096,
            temperature: d_temperature(),
            startup_policy: LlmStartupPolicy::AllowNone,
            allowed_models: Vec::new(),
            providers: Vec::new(),
            pricing: HashMap::new(),
        }
    }
}

impl LlmConfig {
    /// Whether the allow-list admits `model`.
    pub fn is_model_allowed(&self, model: &str) -> bool {
        if self.allowed_models.is_empty() {
            return true;
        }
        self.allowed_models.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => entry == model,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmStartupPolicy {
    #[default]
    AllowNone,
    RequireOne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Model-name prefixes this provider serves. When empty the provider
    /// claims its kind's usual families (e.g. `claude` for Anthropic).
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Override the vision capability advertised by the adapter.
    #[serde(default)]
    pub vision: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
    Google,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Header name (e.g. "Authorization", "x-api-key").
    #[serde(default)]
    pub header: Option<String>,
    /// Header value prefix (e.g. "Bearer ").
    #[serde(default)]
    pub prefix: Option<String>,
    /// Env var containing the key.
    #[serde(default)]
    pub env: Option<String>,
    /// Direct key (for config-only setups; prefer env).
    #[serde(default)]
    pub key: Option<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_120() -> u64 {
    120
}
fn d_4096() -> u32 {
    4096
}
fn d_temperature() -> f32 {
    0.7
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_admits_everything() {
        let config = LlmConfig::default();
        assert!(config.is_model_allowed("anything"));
    }

    #[test]
    fn allow_list_supports_prefix_wildcards() {
        let config = LlmConfig {
            allowed_models: vec!["gpt-4o".into(), "claude-*".into()],
            ..Default::default()
        };
        assert!(config.is_model_allowed("gpt-4o"));
        assert!(!config.is_model_allowed("gpt-4o-mini"));
        assert!(config.is_model_allowed("claude-sonnet-4-20250514"));
        assert!(!config.is_model_allowed("gemini-2.0-flash"));
    }

    #[test]
    fn pricing_and_providers_deserialize() {
        let toml_str = r#"
            allowed_models = ["grok-3-mini"]

            [[providers]]
            id = "xai"
            kind = "openai_compat"
            base_url = "https://api.x.ai/v1"
            models = ["grok"]
            auth = { env = "XAI_API_KEY" }

            [pricing."grok-3-mini"]
            input_per_1m = 0.3
            output_per_1m = 0.5
        "#;
        let config: LlmConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::OpenaiCompat);
        assert_eq!(config.providers[0].models, vec!["grok".to_string()]);
        assert_eq!(config.providers[0].auth.env.as_deref(), Some("XAI_API_KEY"));
        let p = config.pricing.get("grok-3-mini").unwrap();
        assert!((p.output_per_1m - 0.5).abs() < 1e-10);
        assert_eq!(config.request_timeout_secs, 120);
    }
}
