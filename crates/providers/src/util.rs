//! Shared helpers for provider adapters.

use cs_domain::config::{AuthConfig, ProviderConfig, ProviderKind};
use cs_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key from an [`AuthConfig`].
///
/// `key` wins over `env`. `Ok(None)` means no credentials are configured,
/// which is allowed for local OpenAI-compatible servers.
pub fn resolve_api_key(auth: &AuthConfig) -> Result<Option<String>> {
    if let Some(ref key) = auth.key {
        tracing::warn!("API key loaded from plaintext config field 'key'; prefer 'env'");
        return Ok(Some(key.clone()));
    }
    match auth.env {
        Some(ref env_var) => match std::env::var(env_var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
            _ => Err(Error::Auth(format!(
                "environment variable '{env_var}' not set or empty"
            ))),
        },
        None => Ok(None),
    }
}

/// Model-name prefixes a provider claims when its config lists none.
pub(crate) fn default_model_prefixes(kind: ProviderKind, id: &str) -> Vec<String> {
    let prefixes: &[&str] = match kind {
        ProviderKind::Anthropic => &["claude"],
        ProviderKind::Google => &["gemini"],
        ProviderKind::OpenaiCompat => match id {
            "xai" | "grok" => &["grok"],
            "deepseek" => &["deepseek"],
            _ => &["gpt", "chatgpt", "o1", "o3", "o4"],
        },
    };
    prefixes.iter().map(|s| s.to_string()).collect()
}

/// Which models a provider answers for.
#[derive(Debug, Clone)]
pub(crate) struct ModelMatcher {
    provider_id: String,
    prefixes: Vec<String>,
}

impl ModelMatcher {
    pub(crate) fn from_config(cfg: &ProviderConfig) -> Self {
        let prefixes = if cfg.models.is_empty() {
            default_model_prefixes(cfg.kind, &cfg.id)
        } else {
            cfg.models.iter().map(|m| m.to_ascii_lowercase()).collect()
        };
        Self {
            provider_id: cfg.id.clone(),
            prefixes,
        }
    }

    /// `provider_id/model` always matches; otherwise prefix match on the
    /// bare model name.
    pub(crate) fn matches(&self, model: &str) -> bool {
        let lower = model.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix(&format!("{}/", self.provider_id.to_ascii_lowercase())) {
            return !rest.is_empty();
        }
        self.prefixes.iter().any(|p| lower.starts_with(p.as_str()))
    }

    /// The model name as the upstream API expects it.
    pub(crate) fn wire_model<'a>(&self, model: &'a str) -> &'a str {
        model
            .strip_prefix(self.provider_id.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .unwrap_or(model)
    }
}

/// Shared HTTP client with the configured request timeout.
pub(crate) fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(from_reqwest)
}

/// Turn a non-2xx response into a provider error carrying the upstream
/// message when one can be extracted.
pub(crate) async fn status_error(provider: &str, resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.chars().take(300).collect());
    Error::Provider {
        provider: provider.to_owned(),
        message: format!("HTTP {} - {}", status.as_u16(), detail),
    }
}
