mod llm;
mod observability;
mod persistence;
mod server;
mod supervisor;
mod thinking;

pub use llm::*;
pub use observability::*;
pub use persistence::*;
pub use server::*;
pub use supervisor::*;
pub use thinking::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub thinking: ThinkingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }
        if self.server.sse_buffer == 0 {
            errors.push(ConfigError::error(
                "server.sse_buffer",
                "channel capacity must be at least 1",
            ));
        }
        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_minute == 0 {
                errors.push(ConfigError::error(
                    "server.rate_limit.requests_per_minute",
                    "must be greater than 0 (remove the section to disable limiting)",
                ));
            }
        }
        if self.server.cors.allowed_origins.len() == 1 && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError::warning(
                "server.cors.allowed_origins",
                "wildcard \"*\" allows all origins (not recommended for production)",
            ));
        }

        if self.llm.providers.is_empty() {
            errors.push(ConfigError::warning("llm.providers", "no LLM providers configured"));
        }
        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                errors.push(ConfigError::error(
                    format!("llm.providers[{i}].id"),
                    "provider id must not be empty",
                ));
            }
            if provider.base_url.is_empty() {
                errors.push(ConfigError::error(
                    format!("llm.providers[{i}].base_url"),
                    "provider base_url must not be empty",
                ));
            }
            if provider.auth.env.is_none() && provider.auth.key.is_none() {
                errors.push(ConfigError::warning(
                    format!("llm.providers[{i}].auth"),
                    "no key or env configured; requests are sent unauthenticated",
                ));
            }
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            errors.push(ConfigError::error(
                "llm.temperature",
                "temperature must be between 0.0 and 2.0",
            ));
        }
        for (model, price) in &self.llm.pricing {
            if price.input_per_1m < 0.0 || price.output_per_1m < 0.0 {
                errors.push(ConfigError::error(
                    format!("llm.pricing.{model}"),
                    "prices must not be negative",
                ));
            }
        }

        if self.thinking.phase_scale < 0.0 {
            errors.push(ConfigError::error(
                "thinking.phase_scale",
                "phase_scale must not be negative",
            ));
        }
        if self.thinking.real_chunk_chars == 0 {
            errors.push(ConfigError::error(
                "thinking.real_chunk_chars",
                "real_chunk_chars must be greater than 0",
            ));
        }

        if self.persistence.batch_size == 0 {
            errors.push(ConfigError::error(
                "persistence.batch_size",
                "batch_size must be greater than 0",
            ));
        }

        if self.supervisor.model.is_empty() {
            errors.push(ConfigError::error("supervisor.model", "model must not be empty"));
        } else if !self.llm.is_model_allowed(&self.supervisor.model) {
            errors.push(ConfigError::warning(
                "supervisor.model",
                "supervisor model is not in llm.allowed_models",
            ));
        }

        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(ConfigError::error(
                "observability.sample_rate",
                "sample_rate must be between 0.0 and 1.0",
            ));
        }

        errors
    }
}
