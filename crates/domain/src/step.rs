//! Agent steps, supervisor turns and the conversation records that hang off
//! a session (chain).
//!
//! Every type here serializes in camelCase because it is what the browser
//! reads back from the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent step
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a step is connected to the step before it in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Direct,
    Conditional,
    Parallel,
    Collaborative,
}

/// One LLM invocation's visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStep {
    pub id: String,
    pub session_id: String,
    /// Position in the chain (0-based).
    pub index: usize,
    #[serde(default)]
    pub name: Option<String>,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub response: String,
    /// In-flight text; only grows while a stream is active.
    #[serde(default)]
    pub streamed_content: String,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub is_thinking: bool,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub token_usage: Option<Usage>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub execution_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end.
    #[serde(default)]
    pub execution_duration: Option<u64>,
    #[serde(default)]
    pub tokens_per_second: Option<f64>,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub connection_condition: Option<String>,
    #[serde(default)]
    pub was_skipped: bool,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

/// Fields needed to create a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDraft {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub name: Option<String>,
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub connection_condition: Option<String>,
}

impl AgentStep {
    pub fn from_draft(id: String, session_id: String, index: usize, draft: StepDraft) -> Self {
        Self {
            id,
            session_id,
            index,
            name: draft.name,
            model: draft.model,
            prompt: draft.prompt,
            response: String::new(),
            streamed_content: String::new(),
            thinking: String::new(),
            is_thinking: false,
            is_streaming: false,
            is_complete: false,
            error: None,
            token_usage: None,
            estimated_cost: None,
            execution_start_time: None,
            execution_end_time: None,
            execution_duration: None,
            tokens_per_second: None,
            connection_type: draft.connection_type,
            connection_condition: draft.connection_condition,
            was_skipped: false,
            skip_reason: None,
        }
    }

    /// The label users see and mention: display name or `Agent N`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) if !n.trim().is_empty() => n.clone(),
            _ => format!("Agent {}", self.index + 1),
        }
    }

    /// Reset the visible state for a fresh execution of this step.
    ///
    /// This is the only way a completed step becomes non-complete again.
    pub fn begin_execution(&mut self, model: &str, prompt: &str, now: DateTime<Utc>) {
        self.model = model.to_owned();
        self.prompt = prompt.to_owned();
        self.streamed_content.clear();
        self.thinking.clear();
        self.is_thinking = false;
        self.is_streaming = true;
        self.is_complete = false;
        self.error = None;
        self.was_skipped = false;
        self.skip_reason = None;
        self.execution_start_time = Some(now);
        self.execution_end_time = None;
        self.execution_duration = None;
        self.tokens_per_second = None;
    }

    /// Apply a partial update. Returns `false` when the patch was refused
    /// because the step is already complete.
    pub fn apply(&mut self, patch: &StepPatch) -> bool {
        if self.is_complete {
            return false;
        }
        if let Some(ref t) = patch.thinking {
            self.thinking = t.clone();
        }
        if let Some(v) = patch.is_thinking {
            self.is_thinking = v;
        }
        if let Some(v) = patch.is_streaming {
            self.is_streaming = v;
        }
        if let Some(ref e) = patch.error {
            self.error = e.clone();
        }
        true
    }

    /// Replace the in-flight text. Shorter text than what is stored is
    /// ignored so a late write can never make visible content shrink.
    pub fn set_streamed_content(&mut self, text: &str) -> bool {
        if self.is_complete || text.len() < self.streamed_content.len() {
            return false;
        }
        self.streamed_content = text.to_owned();
        true
    }

    /// Finalize the step exactly once. Computes duration and throughput.
    pub fn complete(&mut self, done: &StepCompletion, now: DateTime<Utc>) -> bool {
        if self.is_complete {
            return false;
        }
        let start = self.execution_start_time.unwrap_or(now);
        let duration_ms = (now - start).num_milliseconds().max(0) as u64;

        self.response = done.response.clone();
        if !done.response.is_empty() {
            self.streamed_content = done.response.clone();
        }
        if let Some(ref t) = done.thinking {
            self.thinking = t.clone();
        }
        self.token_usage = done.usage;
        self.estimated_cost = done.estimated_cost;
        self.error = done.error.clone();
        self.was_skipped = done.was_skipped;
        self.skip_reason = done.skip_reason.clone();
        self.is_thinking = false;
        self.is_streaming = false;
        self.is_complete = true;
        self.execution_start_time = Some(start);
        self.execution_end_time = Some(now);
        self.execution_duration = Some(duration_ms);
        self.tokens_per_second = done.usage.and_then(|u| {
            (duration_ms > 0 && u.completion_tokens > 0)
                .then(|| u.completion_tokens as f64 / (duration_ms as f64 / 1000.0))
        });
        true
    }
}

/// A partial step update (thinking/status metadata).
///
/// `error: Some(None)` clears a previous error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thinking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
}

/// Authoritative final state written once when an execution ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompletion {
    pub response: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub was_skipped: bool,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

impl StepCompletion {
    pub fn failed(message: impl Into<String>, partial: String) -> Self {
        Self {
            response: partial,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            was_skipped: true,
            skip_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A delegated task resolved from an `@mention`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionTask {
    pub agent_index: usize,
    pub agent_name: String,
    pub task_prompt: String,
}

/// One supervisor exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorTurn {
    pub id: String,
    pub session_id: String,
    pub user_input: String,
    #[serde(default)]
    pub supervisor_response: String,
    #[serde(default)]
    pub streamed_content: String,
    #[serde(default)]
    pub parsed_mentions: Vec<MentionTask>,
    #[serde(default)]
    pub executed_step_ids: Vec<String>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SupervisorTurn {
    pub fn start(id: String, session_id: String, user_input: String) -> Self {
        Self {
            id,
            session_id,
            user_input,
            supervisor_response: String::new(),
            streamed_content: String::new(),
            parsed_mentions: Vec::new(),
            executed_step_ids: Vec::new(),
            is_complete: false,
            is_streaming: true,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// Who started an agent conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    User,
    Supervisor,
}

/// One exchange in an agent's persisted conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub user_prompt: String,
    pub agent_response: String,
    pub timestamp: DateTime<Utc>,
    pub triggered_by: TriggeredBy,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session (chain)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<AgentStep>,
    #[serde(default)]
    pub supervisor_turns: Vec<SupervisorTurn>,
    /// Keyed by agent (step) index.
    #[serde(default)]
    pub conversation_history: BTreeMap<usize, Vec<ConversationEntry>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn step(&self, step_id: &str) -> Option<&AgentStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_at(&self, index: usize) -> Option<&AgentStep> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn history_for(&self, index: usize) -> &[ConversationEntry] {
        self.conversation_history
            .get(&index)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
