//! Session (chain) management endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use cs_domain::error::Error;
use cs_domain::step::StepDraft;

use super::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;

    if body.steps.is_empty() {
        return Err(Error::Validation("steps must not be empty".into()).into());
    }
    for (i, step) in body.steps.iter().enumerate() {
        if step.model.trim().is_empty() {
            return Err(Error::Validation(format!("steps[{i}].model is required")).into());
        }
        if !state.config.llm.is_model_allowed(&step.model) {
            return Err(Error::Validation(format!(
                "steps[{i}].model {} is not allowed",
                step.model
            ))
            .into());
        }
    }

    let session = state
        .runtime
        .store
        .create_session(body.name, body.steps)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions, GET/DELETE /v1/sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sessions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.runtime.store.list_sessions().await?;
    Ok(Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .runtime
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.runtime.store.delete_session(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("session {id}")).into())
    }
}
