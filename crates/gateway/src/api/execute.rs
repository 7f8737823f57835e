//! Streaming execution endpoints.
//!
//! Requests are validated and their targets looked up before the response
//! starts; anything wrong at that point is a plain JSON rejection. Once the
//! SSE body is returned, the pipeline runs on its own task and every failure
//! is reported in-stream.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use cs_domain::config::Config;
use cs_domain::error::{Error, Result};
use cs_providers::{ClaudeOptions, GrokOptions, ProviderOptions};

use super::error::ApiError;
use crate::runtime::execute::MAX_PROMPT_CHARS;
use crate::runtime::{
    execute_step, run_parallel, run_supervisor_turn, ExecuteRequest, SupervisorRequest,
};
use crate::sse::{sse_body, ChannelSink, Sink, WireEvent};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    #[serde(default)]
    pub step_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub grok_options: Option<GrokOptions>,
    #[serde(default)]
    pub claude_options: Option<ClaudeOptions>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub audio_transcription: Option<String>,
    #[serde(default)]
    pub web_search_results: Option<String>,
}

impl ExecuteBody {
    fn into_request(self) -> ExecuteRequest {
        ExecuteRequest {
            step_id: self.step_id,
            model: self.model,
            prompt: self.prompt,
            images: self.images,
            options: ProviderOptions {
                claude_options: self.claude_options,
                grok_options: self.grok_options,
            },
            audio_transcription: self.audio_transcription,
            web_search_results: self.web_search_results,
        }
    }
}

/// Checks shared by every execution entry point.
pub fn validate_request(req: &ExecuteRequest, config: &Config) -> Result<()> {
    if req.step_id.trim().is_empty() {
        return Err(Error::Validation("stepId is required".into()));
    }
    if req.model.trim().is_empty() {
        return Err(Error::Validation("model is required".into()));
    }
    if !config.llm.is_model_allowed(&req.model) {
        return Err(Error::Validation(format!("model {} is not allowed", req.model)));
    }
    if req.prompt.trim().is_empty() {
        return Err(Error::Validation("prompt is required".into()));
    }
    let chars = req.prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(Error::Validation(format!(
            "prompt is {chars} characters, the limit is {MAX_PROMPT_CHARS}"
        )));
    }
    Ok(())
}

fn require_provider(state: &AppState, model: &str) -> Result<()> {
    if state.llm.resolve(model).is_none() {
        return Err(Error::Validation(format!("no provider configured for model {model}")));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/execute
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn execute(
    State(state): State<AppState>,
    body: std::result::Result<Json<ExecuteBody>, JsonRejection>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let req = body.into_request();
    validate_request(&req, &state.config)?;
    require_provider(&state, &req.model)?;
    state
        .runtime
        .store
        .get_step(&req.step_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("step {}", req.step_id)))?;

    let (mut sink, rx) = ChannelSink::new(state.config.server.sse_buffer);
    let rt = state.runtime.clone();
    tokio::spawn(async move {
        let queue = rt.new_queue();
        let step_id = req.step_id.clone();
        if let Err(e) = execute_step(&rt, &queue, &mut sink, req).await {
            tracing::warn!(step_id = %step_id, error = %e, "execution failed before streaming");
            let _ = sink
                .push(WireEvent::Error {
                    step_id: Some(step_id),
                    message: e.to_string(),
                })
                .await;
        }
        queue.flush().await;
        sink.close().await;
    });

    Ok(sse_body(rx))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:id/run-parallel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParallelBody {
    /// Steps to run. Empty runs every step of the session.
    #[serde(default)]
    pub step_ids: Vec<String>,
}

pub async fn run_parallel_steps(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Option<Json<RunParallelBody>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = state
        .runtime
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

    let steps: Vec<_> = if body.step_ids.is_empty() {
        session.steps.iter().collect()
    } else {
        body.step_ids
            .iter()
            .map(|id| {
                session
                    .step(id)
                    .ok_or_else(|| Error::NotFound(format!("step {id} in session {session_id}")))
            })
            .collect::<Result<_>>()?
    };
    if steps.is_empty() {
        return Err(Error::Validation("session has no steps".into()).into());
    }

    let mut requests = Vec::with_capacity(steps.len());
    for step in steps {
        let req = ExecuteRequest::from_step(step);
        validate_request(&req, &state.config)?;
        require_provider(&state, &req.model)?;
        requests.push(req);
    }

    let (mut sink, rx) = ChannelSink::new(state.config.server.sse_buffer);
    let rt = state.runtime.clone();
    tokio::spawn(async move {
        let queue = rt.new_queue();
        let outcomes = run_parallel(&rt, &queue, &sink, requests).await;
        tracing::debug!(
            session_id = %session_id,
            steps = outcomes.len(),
            "parallel run finished"
        );
        queue.flush().await;
        sink.close().await;
    });

    Ok(sse_body(rx))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorBody {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_input: String,
}

pub async fn supervisor(
    State(state): State<AppState>,
    body: std::result::Result<Json<SupervisorBody>, JsonRejection>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    if body.session_id.trim().is_empty() {
        return Err(Error::Validation("sessionId is required".into()).into());
    }
    if body.user_input.trim().is_empty() {
        return Err(Error::Validation("userInput is required".into()).into());
    }
    if body.user_input.chars().count() > MAX_PROMPT_CHARS {
        return Err(Error::Validation(format!(
            "userInput exceeds {MAX_PROMPT_CHARS} characters"
        ))
        .into());
    }
    state
        .runtime
        .store
        .get_session(&body.session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {}", body.session_id)))?;

    let req = SupervisorRequest {
        session_id: body.session_id,
        user_input: body.user_input,
    };
    let (mut sink, rx) = ChannelSink::new(state.config.server.sse_buffer);
    let rt = state.runtime.clone();
    tokio::spawn(async move {
        let queue = rt.new_queue();
        if let Err(e) = run_supervisor_turn(&rt, &queue, &mut sink, req).await {
            tracing::warn!(error = %e, "supervisor turn failed before streaming");
            let _ = sink
                .push(WireEvent::Error {
                    step_id: None,
                    message: e.to_string(),
                })
                .await;
        }
        queue.flush().await;
        sink.close().await;
    });

    Ok(sse_body(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> ExecuteRequest {
        ExecuteRequest {
            step_id: "s1".into(),
            model: "gpt-4o".into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    #[test]
    fn prompt_bounds() {
        let config = Config::default();
        assert!(validate_request(&request("hi"), &config).is_ok());
        assert!(validate_request(&request("   "), &config).is_err());
        assert!(validate_request(&request(&"a".repeat(MAX_PROMPT_CHARS)), &config).is_ok());
        assert!(validate_request(&request(&"a".repeat(MAX_PROMPT_CHARS + 1)), &config).is_err());
    }

    #[test]
    fn allow_list_is_enforced() {
        let mut config = Config::default();
        config.llm.allowed_models = vec!["claude-*".into()];
        let err = validate_request(&request("hi"), &config).unwrap_err();
        assert_eq!(err.to_string(), "model gpt-4o is not allowed");
    }

    #[test]
    fn body_maps_provider_options() {
        let body: ExecuteBody = serde_json::from_str(
            r#"{"stepId":"s","model":"grok-3","prompt":"p","grokOptions":{"reasoningEffort":"high"}}"#,
        )
        .unwrap();
        let req = body.into_request();
        assert_eq!(
            req.options.grok_options.unwrap().reasoning_effort.as_deref(),
            Some("high")
        );
        assert!(req.options.claude_options.is_none());
    }
}
