//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances in config
//! order. Model resolution asks each provider whether it `supports` the
//! model and takes the first that does, so adding a provider never touches
//! the others.

use crate::anthropic::AnthropicProvider;
use crate::google::GoogleProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use cs_domain::config::{LlmConfig, LlmStartupPolicy, ProviderKind};
use cs_domain::error::{Error, Result};
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
    /// Providers that failed to initialize: (id, error message).
    init_errors: Vec<(String, String)>,
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// Providers that fail to initialize (usually a missing API key env
    /// var) are logged and skipped. With `startup_policy = "require_one"`
    /// an empty result is an error.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut registry = Self::default();
        let timeout = config.request_timeout_secs;

        for pc in &config.providers {
            let result: Result<Arc<dyn LlmProvider>> = match pc.kind {
                ProviderKind::OpenaiCompat => OpenAiCompatProvider::from_config(pc, timeout)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                ProviderKind::Anthropic => AnthropicProvider::from_config(pc, timeout)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                ProviderKind::Google => GoogleProvider::from_config(pc, timeout)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
            };

            match result {
                Ok(provider) => {
                    tracing::info!(provider_id = %pc.id, kind = ?pc.kind, "registered LLM provider");
                    registry.providers.push(provider);
                }
                Err(e) => {
                    tracing::warn!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        error = %e,
                        "failed to initialize LLM provider, skipping"
                    );
                    registry.init_errors.push((pc.id.clone(), e.to_string()));
                }
            }
        }

        if registry.providers.is_empty() {
            if config.startup_policy == LlmStartupPolicy::RequireOne {
                return Err(Error::Config(
                    "no LLM provider initialized and startup_policy = require_one".into(),
                ));
            }
            tracing::warn!("no LLM providers initialized; execution requests will be rejected");
        }

        Ok(registry)
    }

    /// Build a registry from ready-made providers (tests, embedding).
    pub fn with_providers(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            providers,
            init_errors: Vec::new(),
        }
    }

    /// First provider, in config order, that supports `model`.
    pub fn resolve(&self, model: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.iter().find(|p| p.supports(model)).cloned()
    }

    /// Look up a provider by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.provider_id() == provider_id)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn LlmProvider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn init_errors(&self) -> &[(String, String)] {
        &self.init_errors
    }
}
