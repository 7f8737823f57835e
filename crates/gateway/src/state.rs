use std::sync::Arc;

use cs_domain::config::Config;
use cs_providers::ProviderRegistry;
use cs_store::JsonStepStore;

use crate::runtime::rate_limit::RateLimiter;
use crate::runtime::Runtime;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,
    pub runtime: Runtime,
    /// Concrete store handle, kept for the periodic and shutdown flushes.
    pub json_store: Arc<JsonStepStore>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
    /// `None` when `server.rate_limit` is not configured.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}
