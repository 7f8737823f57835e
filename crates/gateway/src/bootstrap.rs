//! AppState construction shared by `serve` and `run`.

use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};

use cs_domain::config::{Config, ConfigSeverity};
use cs_providers::{ProviderRegistry, StreamAdapter};
use cs_store::{JsonStepStore, StepStore};

use crate::runtime::rate_limit::{KeyedRateLimiter, RateLimiter};
use crate::runtime::scheduler::TokioScheduler;
use crate::runtime::Runtime;
use crate::state::AppState;

/// Where the step store lives.
pub enum StoreMode {
    /// Load from and flush to `persistence.state_path`.
    File,
    /// Nothing touches disk (one-shot CLI runs).
    Memory,
}

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub fn build_app_state(config: Arc<Config>, mode: StoreMode) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── LLM providers ────────────────────────────────────────────────
    let llm = Arc::new(
        ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?,
    );
    tracing::info!(providers = llm.len(), "LLM providers ready");

    // ── Step store ───────────────────────────────────────────────────
    let json_store = Arc::new(match mode {
        StoreMode::File => JsonStepStore::open(&config.persistence.state_path)
            .with_context(|| {
                format!(
                    "opening step store at {}",
                    config.persistence.state_path.display()
                )
            })?,
        StoreMode::Memory => JsonStepStore::in_memory(),
    });
    let store: Arc<dyn StepStore> = json_store.clone();

    // ── Runtime ──────────────────────────────────────────────────────
    let adapter = StreamAdapter::new(
        Arc::clone(&llm),
        config.llm.max_output_tokens,
        config.llm.temperature,
    );
    let runtime = Runtime::new(&config, store, adapter, Arc::new(TokioScheduler));

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(t) => {
                tracing::info!(source = %format!("env:{env_var}"), "API bearer-token auth enabled");
                Some(Sha256::digest(t.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!("API bearer-token auth DISABLED, set the {env_var} env var to enable it");
                None
            }
        }
    };

    // ── Rate limiting ────────────────────────────────────────────────
    let rate_limiter = match config.server.rate_limit.as_ref() {
        Some(rl) => {
            tracing::info!(requests_per_minute = rl.requests_per_minute, "per-IP rate limiting enabled");
            Some(Arc::new(KeyedRateLimiter::new(rl)?) as Arc<dyn RateLimiter>)
        }
        None => {
            tracing::info!("per-IP rate limiting disabled (no [server.rate_limit] in config)");
            None
        }
    };

    Ok(AppState {
        config,
        llm,
        runtime,
        json_store,
        api_token_hash,
        rate_limiter,
    })
}
