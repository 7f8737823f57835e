//! Single-step execution pipeline and parallel chain runs.
//!
//! A pipeline loads the step, applies its connection condition, streams the
//! model through the thinking manager into the sink, and writes the final
//! fields once. Once the stream is open, failures become one `error` event
//! and a terminal error state on the step.

use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;

use cs_domain::error::{Error, Result};
use cs_domain::message::Message;
use cs_domain::step::{
    AgentStep, ConnectionType, ConversationEntry, StepCompletion, TriggeredBy,
};
use cs_domain::stream::{Chunk, Usage};
use cs_domain::trace::TraceEvent;
use cs_providers::{ProviderOptions, StreamRequest};

use super::condition::{Condition, PreviousOutcome};
use super::persist_queue::PersistenceQueue;
use super::thinking::ThinkingManager;
use super::Runtime;
use crate::sse::{Sink, WireEvent};

/// Longest prompt accepted for one execution, in characters.
pub const MAX_PROMPT_CHARS: usize = 50_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub step_id: String,
    pub model: String,
    pub prompt: String,
    pub images: Vec<String>,
    pub options: ProviderOptions,
    pub audio_transcription: Option<String>,
    pub web_search_results: Option<String>,
}

impl ExecuteRequest {
    /// Run a stored step as defined.
    pub fn from_step(step: &AgentStep) -> Self {
        Self {
            step_id: step.id.clone(),
            model: step.model.clone(),
            prompt: step.prompt.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { response: String, usage: Usage },
    Failed { message: String },
    Skipped { reason: String },
    /// The sink closed mid-stream; the upstream call was dropped.
    Disconnected,
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Completed { .. } => "completed",
            StepOutcome::Failed { .. } => "failed",
            StepOutcome::Skipped { .. } => "skipped",
            StepOutcome::Disconnected => "disconnected",
        }
    }
}

/// How a streamed step's chunks appear on the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Relay {
    /// `token` / `thinking` events.
    Direct,
    /// `agent_execution_internal` events for a supervisor delegation.
    Delegated { agent_index: usize },
}

impl Relay {
    fn event(self, step_id: &str, kind: &str, content: String) -> WireEvent {
        match self {
            Relay::Direct if kind == "thinking" => WireEvent::Thinking {
                step_id: step_id.to_owned(),
                content,
            },
            Relay::Direct => WireEvent::Token {
                step_id: step_id.to_owned(),
                content,
            },
            Relay::Delegated { agent_index } => WireEvent::AgentExecutionInternal {
                step_id: step_id.to_owned(),
                agent_index,
                kind: kind.to_owned(),
                content,
            },
        }
    }
}

#[derive(Debug)]
pub(crate) enum StreamEnd {
    Completed { content: String, usage: Usage },
    Failed { message: String, partial: String },
    Disconnected { partial: String },
}

#[derive(Debug)]
pub(crate) struct Streamed {
    pub end: StreamEnd,
    pub thinking: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline pieces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stream `request` into the step, relaying every chunk to `sink` before
/// pulling the next one.
pub(crate) async fn stream_into_step(
    rt: &Runtime,
    queue: &PersistenceQueue,
    sink: &mut dyn Sink,
    step_id: &str,
    request: StreamRequest,
    relay: Relay,
) -> Streamed {
    let mut tm = ThinkingManager::new(step_id, &request.model, rt.thinking_deps(queue));
    tm.start();

    let upstream = rt.adapter.stream_messages(request);
    let mut partial = String::new();
    let mut end = None;

    {
        let mut chunks = std::pin::pin!(tm.drive(upstream));
        while let Some(chunk) = chunks.next().await {
            let event = match chunk {
                Chunk::Thinking { text } => relay.event(step_id, "thinking", text),
                Chunk::Content { text } => {
                    partial.push_str(&text);
                    relay.event(step_id, "token", text)
                }
                Chunk::Complete { content, usage } => {
                    end = Some(StreamEnd::Completed { content, usage });
                    break;
                }
                Chunk::Error { message } => {
                    end = Some(StreamEnd::Failed {
                        message,
                        partial: std::mem::take(&mut partial),
                    });
                    break;
                }
            };
            if sink.push(event).await.is_err() {
                tracing::info!(step_id, "client disconnected, dropping upstream call");
                end = Some(StreamEnd::Disconnected {
                    partial: std::mem::take(&mut partial),
                });
                break;
            }
        }
    }

    tm.cleanup().await;

    Streamed {
        end: end.unwrap_or(StreamEnd::Failed {
            message: "stream ended before completion".into(),
            partial,
        }),
        thinking: tm.thinking_text().to_owned(),
    }
}

/// Write the final fields. Store failures are logged, not surfaced.
pub(crate) async fn finalize(
    rt: &Runtime,
    step_id: &str,
    model: &str,
    completion: &StepCompletion,
) -> Option<AgentStep> {
    let step = match rt.store.complete_execution(step_id, completion).await {
        Ok(step) => step,
        Err(e) => {
            tracing::warn!(step_id, error = %e, "failed to record step completion");
            return None;
        }
    };

    TraceEvent::StepCompleted {
        step_id: step_id.to_owned(),
        model: model.to_owned(),
        duration_ms: step.execution_duration.unwrap_or(0),
        estimated_cost: step.estimated_cost,
        skipped: step.was_skipped,
        error: step.error.clone(),
    }
    .emit();

    Some(step)
}

pub(crate) fn completion_for(
    rt: &Runtime,
    model: &str,
    content: String,
    usage: Usage,
    thinking: String,
) -> StepCompletion {
    let cost = rt
        .prices
        .cost(model, usage.prompt_tokens, usage.completion_tokens);
    StepCompletion {
        response: content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        usage: Some(usage),
        estimated_cost: Some(cost),
        ..Default::default()
    }
}

/// Append audio transcripts and search results as labelled context.
pub fn augment_prompt(
    prompt: &str,
    audio_transcription: Option<&str>,
    web_search_results: Option<&str>,
) -> String {
    let mut out = prompt.to_owned();
    if let Some(audio) = audio_transcription.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str("\n\n[Audio transcription]\n");
        out.push_str(audio);
    }
    if let Some(web) = web_search_results.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str("\n\n[Web search results]\n");
        out.push_str(web);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single step
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one step end to end.
///
/// `Err` is only returned for failures before the first event (unknown
/// step, store unavailable); the caller turns it into an `error` event.
pub async fn execute_step(
    rt: &Runtime,
    queue: &PersistenceQueue,
    sink: &mut dyn Sink,
    req: ExecuteRequest,
) -> Result<StepOutcome> {
    let started = Instant::now();
    let step = rt
        .store
        .get_step(&req.step_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("step {}", req.step_id)))?;

    if step.connection_type == ConnectionType::Conditional {
        if let Some(reason) = failed_condition(rt, &step).await? {
            return skip_step(rt, sink, &step, &req, reason).await;
        }
    }

    rt.store
        .begin_execution(&step.id, &req.model, &req.prompt)
        .await?;

    let prompt = augment_prompt(
        &req.prompt,
        req.audio_transcription.as_deref(),
        req.web_search_results.as_deref(),
    );
    let request = StreamRequest {
        model: req.model.clone(),
        messages: vec![Message::user(prompt)],
        images: req.images.clone(),
        options: req.options.clone(),
        step_id: Some(step.id.clone()),
        ..Default::default()
    };

    let streamed = stream_into_step(rt, queue, sink, &step.id, request, Relay::Direct).await;

    let outcome = match streamed.end {
        StreamEnd::Completed { content, usage } => {
            let completion =
                completion_for(rt, &req.model, content.clone(), usage, streamed.thinking);
            let done = finalize(rt, &step.id, &req.model, &completion).await;

            let entry = ConversationEntry {
                user_prompt: req.prompt.clone(),
                agent_response: content.clone(),
                timestamp: Utc::now(),
                triggered_by: TriggeredBy::User,
            };
            if let Err(e) = rt
                .store
                .record_conversation_turn(&step.session_id, step.index, entry)
                .await
            {
                tracing::warn!(step_id = %step.id, error = %e, "failed to record conversation turn");
            }

            let event = WireEvent::Complete {
                step_id: step.id.clone(),
                response: content.clone(),
                usage: Some(usage),
                estimated_cost: completion.estimated_cost,
                execution_duration: done.as_ref().and_then(|s| s.execution_duration),
                tokens_per_second: done.as_ref().and_then(|s| s.tokens_per_second),
                was_skipped: false,
                skip_reason: None,
            };
            if sink.push(event).await.is_err() {
                StepOutcome::Disconnected
            } else {
                StepOutcome::Completed {
                    response: content,
                    usage,
                }
            }
        }
        StreamEnd::Failed { message, partial } => {
            tracing::warn!(step_id = %step.id, model = %req.model, error = %message, "step execution failed");
            let mut completion = StepCompletion::failed(message.clone(), partial);
            completion.thinking = (!streamed.thinking.is_empty()).then_some(streamed.thinking);
            finalize(rt, &step.id, &req.model, &completion).await;
            let _ = sink
                .push(WireEvent::Error {
                    step_id: Some(step.id.clone()),
                    message: message.clone(),
                })
                .await;
            StepOutcome::Failed { message }
        }
        StreamEnd::Disconnected { partial } => {
            let completion = StepCompletion::failed("client disconnected", partial);
            finalize(rt, &step.id, &req.model, &completion).await;
            StepOutcome::Disconnected
        }
    };

    tracing::debug!(
        step_id = %step.id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        outcome = outcome.label(),
        "step pipeline finished"
    );
    Ok(outcome)
}

/// The skip reason when the step's condition rejects the previous output.
async fn failed_condition(rt: &Runtime, step: &AgentStep) -> Result<Option<String>> {
    let raw = step.connection_condition.clone().unwrap_or_default();
    let condition = Condition::parse(&raw);

    let session = rt.store.get_session(&step.session_id).await?;
    let previous = step
        .index
        .checked_sub(1)
        .and_then(|i| session.as_ref().and_then(|s| s.step_at(i)));
    let outcome = previous.map(PreviousOutcome::from).unwrap_or_default();

    if condition.evaluate(&outcome) {
        Ok(None)
    } else {
        Ok(Some(condition.skip_reason(&raw)))
    }
}

async fn skip_step(
    rt: &Runtime,
    sink: &mut dyn Sink,
    step: &AgentStep,
    req: &ExecuteRequest,
    reason: String,
) -> Result<StepOutcome> {
    tracing::info!(step_id = %step.id, reason = %reason, "skipping conditional step");
    rt.store
        .begin_execution(&step.id, &req.model, &req.prompt)
        .await?;
    let done = finalize(rt, &step.id, &req.model, &StepCompletion::skipped(reason.clone())).await;

    let event = WireEvent::Complete {
        step_id: step.id.clone(),
        response: String::new(),
        usage: None,
        estimated_cost: None,
        execution_duration: done.as_ref().and_then(|s| s.execution_duration),
        tokens_per_second: None,
        was_skipped: true,
        skip_reason: Some(reason.clone()),
    };
    if sink.push(event).await.is_err() {
        return Ok(StepOutcome::Disconnected);
    }
    Ok(StepOutcome::Skipped { reason })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parallel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run several steps as independent pipelines on one response. Events from
/// different steps interleave; each carries its `stepId`.
pub async fn run_parallel<S>(
    rt: &Runtime,
    queue: &PersistenceQueue,
    sink: &S,
    requests: Vec<ExecuteRequest>,
) -> Vec<(String, StepOutcome)>
where
    S: Sink + Clone,
{
    let runs = requests.into_iter().map(|req| {
        let mut sink = sink.clone();
        async move {
            let step_id = req.step_id.clone();
            let outcome = match execute_step(rt, queue, &mut sink, req).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = e.to_string();
                    let _ = sink
                        .push(WireEvent::Error {
                            step_id: Some(step_id.clone()),
                            message: message.clone(),
                        })
                        .await;
                    StepOutcome::Failed { message }
                }
            };
            (step_id, outcome)
        }
    });
    join_all(runs).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_augmentation_adds_labelled_blocks() {
        let out = augment_prompt("Summarize.", Some("  hello from audio "), Some(""));
        assert_eq!(out, "Summarize.\n\n[Audio transcription]\nhello from audio");

        let out = augment_prompt("Q", None, Some("1. result"));
        assert!(out.ends_with("[Web search results]\n1. result"));
        assert_eq!(augment_prompt("Q", None, None), "Q");
    }

    #[test]
    fn relay_maps_chunk_kinds() {
        assert!(matches!(
            Relay::Direct.event("s", "thinking", "t".into()),
            WireEvent::Thinking { .. }
        ));
        assert!(matches!(
            Relay::Direct.event("s", "token", "t".into()),
            WireEvent::Token { .. }
        ));
        match (Relay::Delegated { agent_index: 2 }).event("s", "token", "t".into()) {
            WireEvent::AgentExecutionInternal { agent_index, kind, .. } => {
                assert_eq!(agent_index, 2);
                assert_eq!(kind, "token");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
