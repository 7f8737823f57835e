//! Supervisor turns.
//!
//! The supervisor model answers the user first (streamed as
//! `supervisor_chunk`). Mentions are then resolved from the user's message,
//! or from the supervisor's reply when the user mentioned nobody, and each
//! delegated task runs through the same streaming path as a single step,
//! strictly one after another. A failing delegate is recorded on its own
//! step and the turn moves on to the next mention.

use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;

use cs_domain::error::{Error, Result};
use cs_domain::message::Message;
use cs_domain::step::{
    AgentStep, ConversationEntry, MentionTask, Session, StepCompletion, SupervisorTurn,
    TriggeredBy,
};
use cs_domain::stream::Chunk;
use cs_domain::trace::TraceEvent;
use cs_providers::StreamRequest;

use super::execute::{completion_for, finalize, stream_into_step, Relay, StreamEnd};
use super::mentions::{infer_target, parse_explicit, KnownAgent};
use super::persist_queue::PersistenceQueue;
use super::Runtime;
use crate::sse::{MentionOutcome, Sink, WireEvent};

/// Characters of another agent's response carried into a delegated prompt.
const PEER_RESPONSE_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct SupervisorRequest {
    pub session_id: String,
    pub user_input: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSummary {
    pub turn_id: String,
    pub response: String,
    pub mentions: Vec<MentionTask>,
    pub invalid_mentions: Vec<String>,
    pub executed_step_ids: Vec<String>,
    pub outcomes: Vec<MentionOutcome>,
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one supervisor turn. The turn always ends complete; delegate
/// failures only show up in the per-mention outcomes.
pub async fn run_supervisor_turn(
    rt: &Runtime,
    queue: &PersistenceQueue,
    sink: &mut dyn Sink,
    req: SupervisorRequest,
) -> Result<SupervisorSummary> {
    let started = Instant::now();
    let session = rt
        .store
        .get_session(&req.session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {}", req.session_id)))?;

    let mut turn = SupervisorTurn::start(
        uuid::Uuid::new_v4().to_string(),
        session.id.clone(),
        req.user_input.clone(),
    );
    save_turn(rt, &turn).await;

    let mut disconnected = sink
        .push(WireEvent::SupervisorTurnStart {
            turn_id: turn.id.clone(),
            session_id: session.id.clone(),
        })
        .await
        .is_err();

    // ── Supervisor reply ─────────────────────────────────────────────
    if !disconnected {
        disconnected = stream_supervisor_reply(rt, sink, &session, &mut turn).await;
    }

    // ── Mention resolution ───────────────────────────────────────────
    let agents: Vec<KnownAgent> = session.steps.iter().map(KnownAgent::from).collect();
    let from_user = parse_explicit(&req.user_input, &agents);
    let invalid = from_user.invalid.clone();
    let mentions = if !from_user.mentions.is_empty() {
        from_user.mentions
    } else {
        let from_reply = parse_explicit(&turn.supervisor_response, &agents);
        if !from_reply.mentions.is_empty() {
            from_reply.mentions
        } else {
            infer_target(&req.user_input, &agents).into_iter().collect()
        }
    };
    turn.parsed_mentions = mentions.clone();
    save_turn(rt, &turn).await;

    if !invalid.is_empty() && !disconnected {
        disconnected = sink
            .push(WireEvent::InvalidMentions {
                mentions: invalid.clone(),
            })
            .await
            .is_err();
    }

    // ── Delegations, strictly in order ───────────────────────────────
    let mut outcomes = Vec::with_capacity(mentions.len());
    for mention in &mentions {
        if disconnected {
            outcomes.push(MentionOutcome::NotRun {
                agent_index: mention.agent_index,
            });
            continue;
        }
        let (outcome, gone) = run_mention(rt, queue, sink, &session.id, &req.user_input, mention).await;
        disconnected = gone;
        if let MentionOutcome::Completed { step_id, .. }
        | MentionOutcome::Failed {
            step_id: Some(step_id),
            ..
        } = &outcome
        {
            turn.executed_step_ids.push(step_id.clone());
        }
        outcomes.push(outcome);
    }

    // ── Close the turn ───────────────────────────────────────────────
    turn.is_complete = true;
    turn.is_streaming = false;
    if disconnected && turn.error.is_none() {
        turn.error = Some("client disconnected".into());
    }
    save_turn(rt, &turn).await;

    let failed = outcomes.iter().filter(|o| o.is_failed()).count();
    TraceEvent::SupervisorTurn {
        turn_id: turn.id.clone(),
        session_id: session.id.clone(),
        mentions: mentions.len(),
        invalid_mentions: invalid.len(),
        failed,
        duration_ms: started.elapsed().as_millis() as u64,
    }
    .emit();

    if !disconnected {
        let _ = sink
            .push(WireEvent::SupervisorComplete {
                turn_id: turn.id.clone(),
                response: turn.supervisor_response.clone(),
                mentions: mentions.clone(),
                executed_step_ids: turn.executed_step_ids.clone(),
                outcomes: outcomes.clone(),
                error: turn.error.clone(),
            })
            .await;
    }

    Ok(SupervisorSummary {
        turn_id: turn.id,
        response: turn.supervisor_response,
        mentions,
        invalid_mentions: invalid,
        executed_step_ids: turn.executed_step_ids,
        outcomes,
        error: turn.error,
    })
}

/// Stream the supervisor model's reply into `turn`. Returns `true` if the
/// client went away.
async fn stream_supervisor_reply(
    rt: &Runtime,
    sink: &mut dyn Sink,
    session: &Session,
    turn: &mut SupervisorTurn,
) -> bool {
    let mut messages = vec![Message::system(system_prompt(session))];
    let earlier = session
        .supervisor_turns
        .iter()
        .filter(|t| t.is_complete && t.id != turn.id);
    let skip = earlier.clone().count().saturating_sub(rt.supervisor.history_turns);
    for prior in earlier.skip(skip) {
        messages.push(Message::user(prior.user_input.clone()));
        if !prior.supervisor_response.is_empty() {
            messages.push(Message::assistant(prior.supervisor_response.clone()));
        }
    }
    messages.push(Message::user(turn.user_input.clone()));

    let request = StreamRequest {
        model: rt.supervisor.model.clone(),
        messages,
        max_tokens: Some(rt.supervisor.max_tokens),
        ..Default::default()
    };

    let mut upstream = rt.adapter.stream_messages(request);
    while let Some(chunk) = upstream.next().await {
        match chunk {
            Chunk::Content { text } => {
                turn.streamed_content.push_str(&text);
                let event = WireEvent::SupervisorChunk {
                    turn_id: turn.id.clone(),
                    content: text,
                };
                if sink.push(event).await.is_err() {
                    turn.supervisor_response = turn.streamed_content.clone();
                    return true;
                }
            }
            Chunk::Thinking { .. } => {}
            Chunk::Complete { content, .. } => {
                turn.supervisor_response = content;
                break;
            }
            Chunk::Error { message } => {
                tracing::warn!(turn_id = %turn.id, error = %message, "supervisor reply failed");
                turn.supervisor_response = turn.streamed_content.clone();
                turn.error = Some(message.clone());
                let event = WireEvent::Error {
                    step_id: None,
                    message,
                };
                return sink.push(event).await.is_err();
            }
        }
    }
    false
}

/// Execute one delegated mention. Returns the outcome and whether the
/// client went away.
async fn run_mention(
    rt: &Runtime,
    queue: &PersistenceQueue,
    sink: &mut dyn Sink,
    session_id: &str,
    user_input: &str,
    mention: &MentionTask,
) -> (MentionOutcome, bool) {
    let agent_index = mention.agent_index;

    // Re-read so the prompt sees what earlier delegations produced.
    let session = match rt.store.get_session(session_id).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return delegate_error(sink, agent_index, None, format!("session {session_id} no longer exists")).await;
        }
        Err(e) => return delegate_error(sink, agent_index, None, e.to_string()).await,
    };
    let Some(step) = session.step_at(agent_index).cloned() else {
        return delegate_error(sink, agent_index, None, format!("agent {} no longer exists", agent_index + 1)).await;
    };

    if let Err(e) = rt
        .store
        .begin_execution(&step.id, &step.model, &mention.task_prompt)
        .await
    {
        return delegate_error(sink, agent_index, Some(step.id), e.to_string()).await;
    }

    let start = WireEvent::MentionExecutionStart {
        step_id: step.id.clone(),
        agent_index,
        agent_name: mention.agent_name.clone(),
        task_prompt: mention.task_prompt.clone(),
    };
    if sink.push(start).await.is_err() {
        finalize(rt, &step.id, &step.model, &StepCompletion::failed("client disconnected", String::new())).await;
        return (
            MentionOutcome::Failed {
                agent_index,
                step_id: Some(step.id),
                error: "client disconnected".into(),
            },
            true,
        );
    }

    let prompt = build_delegated_prompt(
        &session,
        &step,
        user_input,
        &mention.task_prompt,
        rt.supervisor.history_turns,
    );
    let request = StreamRequest {
        model: step.model.clone(),
        messages: vec![Message::user(prompt)],
        step_id: Some(step.id.clone()),
        ..Default::default()
    };

    let streamed = stream_into_step(
        rt,
        queue,
        sink,
        &step.id,
        request,
        Relay::Delegated { agent_index },
    )
    .await;

    match streamed.end {
        StreamEnd::Completed { content, usage } => {
            let completion =
                completion_for(rt, &step.model, content.clone(), usage, streamed.thinking);
            finalize(rt, &step.id, &step.model, &completion).await;

            let entry = ConversationEntry {
                user_prompt: mention.task_prompt.clone(),
                agent_response: content.clone(),
                timestamp: Utc::now(),
                triggered_by: TriggeredBy::Supervisor,
            };
            if let Err(e) = rt
                .store
                .record_conversation_turn(session_id, agent_index, entry)
                .await
            {
                tracing::warn!(step_id = %step.id, error = %e, "failed to record conversation turn");
            }

            let gone = sink
                .push(WireEvent::AgentExecutionComplete {
                    step_id: step.id.clone(),
                    agent_index,
                    response: content,
                    usage: Some(usage),
                    estimated_cost: completion.estimated_cost,
                })
                .await
                .is_err();
            (
                MentionOutcome::Completed {
                    agent_index,
                    step_id: step.id,
                },
                gone,
            )
        }
        StreamEnd::Failed { message, partial } => {
            tracing::warn!(step_id = %step.id, agent_index, error = %message, "delegated task failed");
            finalize(rt, &step.id, &step.model, &StepCompletion::failed(message.clone(), partial)).await;
            delegate_error(sink, agent_index, Some(step.id), message).await
        }
        StreamEnd::Disconnected { partial } => {
            finalize(rt, &step.id, &step.model, &StepCompletion::failed("client disconnected", partial)).await;
            (
                MentionOutcome::Failed {
                    agent_index,
                    step_id: Some(step.id),
                    error: "client disconnected".into(),
                },
                true,
            )
        }
    }
}

async fn delegate_error(
    sink: &mut dyn Sink,
    agent_index: usize,
    step_id: Option<String>,
    message: String,
) -> (MentionOutcome, bool) {
    let gone = sink
        .push(WireEvent::AgentExecutionError {
            step_id: step_id.clone(),
            agent_index,
            message: message.clone(),
        })
        .await
        .is_err();
    (
        MentionOutcome::Failed {
            agent_index,
            step_id,
            error: message,
        },
        gone,
    )
}

async fn save_turn(rt: &Runtime, turn: &SupervisorTurn) {
    if let Err(e) = rt.store.save_supervisor_turn(turn).await {
        tracing::warn!(turn_id = %turn.id, error = %e, "failed to save supervisor turn");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn system_prompt(session: &Session) -> String {
    let mut out = String::from(
        "You are the supervisor of a team of AI agents working on the same project. \
         Answer the user briefly, and delegate work by writing @ followed by the agent's \
         name and then the task, for example \"@Agent 1 summarize the findings\". \
         Only mention an agent when it should act.\n\nAvailable agents:\n",
    );
    for step in &session.steps {
        out.push_str(&format!("- {} (model: {})", step.display_name(), step.model));
        let role = step.prompt.trim();
        if !role.is_empty() {
            out.push_str(&format!(": {}", truncate_chars(role, 200)));
        }
        out.push('\n');
    }
    out
}

/// Prompt for a delegated task: the agent's own history, what the other
/// agents last produced, the supervisor instruction and the task itself.
pub fn build_delegated_prompt(
    session: &Session,
    target: &AgentStep,
    user_input: &str,
    task: &str,
    history_turns: usize,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    let history = session.history_for(target.index);
    if !history.is_empty() {
        let skip = history.len().saturating_sub(history_turns);
        let mut block = String::from("## Your previous conversation");
        for entry in &history[skip..] {
            block.push_str(&format!(
                "\n\nUser: {}\n\nYou: {}",
                entry.user_prompt.trim(),
                entry.agent_response.trim()
            ));
        }
        sections.push(block);
    }

    let peers: Vec<String> = session
        .steps
        .iter()
        .filter(|s| s.index != target.index)
        .filter_map(|s| {
            let latest = session
                .history_for(s.index)
                .last()
                .map(|e| e.agent_response.as_str())
                .filter(|r| !r.trim().is_empty())
                .or_else(|| Some(s.response.as_str()).filter(|r| !r.trim().is_empty()))?;
            Some(format!(
                "### {} ({})\n{}",
                s.display_name(),
                s.model,
                truncate_chars(latest.trim(), PEER_RESPONSE_CHARS)
            ))
        })
        .collect();
    if !peers.is_empty() {
        sections.push(format!("## Latest work from other agents\n\n{}", peers.join("\n\n")));
    }

    sections.push(format!("## Supervisor instruction\n\n{}", user_input.trim()));

    if task.trim() != user_input.trim() {
        sections.push(format!("## Your task\n\n{}", task.trim()));
    }

    sections.join("\n\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_owned(),
    }
}
