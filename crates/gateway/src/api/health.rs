use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// Liveness probe (public, no auth).
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.llm.len(),
    }))
}
