use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    model: String,
    /// Provider that would serve the model, `None` when nothing resolves it.
    provider: Option<String>,
}

/// `GET /v1/models`: the allow-list and, per entry, the resolving provider.
/// Prefix entries (`gpt-4o*`) are resolved by their prefix.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models: Vec<ModelEntry> = state
        .config
        .llm
        .allowed_models
        .iter()
        .map(|entry| ModelEntry {
            model: entry.clone(),
            provider: state
                .llm
                .resolve(entry.trim_end_matches('*'))
                .map(|p| p.provider_id().to_owned()),
        })
        .collect();

    let providers: Vec<serde_json::Value> = state
        .llm
        .iter()
        .map(|p| {
            let caps = p.capabilities();
            serde_json::json!({
                "id": p.provider_id(),
                "supportsVision": caps.supports_vision,
                "contextWindowTokens": caps.context_window_tokens,
            })
        })
        .collect();

    let init_errors: Vec<serde_json::Value> = state
        .llm
        .init_errors()
        .iter()
        .map(|(id, error)| serde_json::json!({ "id": id, "error": error }))
        .collect();

    Json(serde_json::json!({
        "models": models,
        "allowAll": state.config.llm.allowed_models.is_empty(),
        "providers": providers,
        "initErrors": init_errors,
    }))
}
