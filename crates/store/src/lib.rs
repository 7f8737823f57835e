//! Persistence for ChainStream: sessions (chains), agent steps, supervisor
//! turns and per-agent conversation history.
//!
//! [`StepStore`] is the contract the execution runtime writes through.
//! [`JsonStepStore`] is the bundled implementation.

pub mod store;

use chrono::{DateTime, Utc};
use serde::Serialize;

use cs_domain::error::Result;
use cs_domain::step::{
    AgentStep, ConversationEntry, Session, StepCompletion, StepDraft, StepPatch, SupervisorTurn,
};

pub use store::JsonStepStore;

/// Listing row for a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub steps: usize,
    pub supervisor_turns: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for step and turn state.
///
/// Implementations must make `update_step` and `update_streamed_content`
/// no-ops on a completed step, and `complete_execution` effective only once
/// per execution. `begin_execution` is the only way back out of the
/// completed state.
#[async_trait::async_trait]
pub trait StepStore: Send + Sync {
    async fn create_session(&self, name: Option<String>, steps: Vec<StepDraft>) -> Result<Session>;

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Delete a session with its steps, turns and history.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    async fn create_step(&self, session_id: &str, draft: StepDraft) -> Result<String>;

    async fn get_step(&self, step_id: &str) -> Result<Option<AgentStep>>;

    /// Reset a step's visible state for a new execution and stamp its
    /// start time.
    async fn begin_execution(&self, step_id: &str, model: &str, prompt: &str) -> Result<AgentStep>;

    async fn update_step(&self, step_id: &str, patch: &StepPatch) -> Result<()>;

    /// Replace the in-flight text with `full_text`.
    async fn update_streamed_content(&self, step_id: &str, full_text: &str) -> Result<()>;

    /// Write the final fields; computes duration and tokens per second.
    async fn complete_execution(&self, step_id: &str, done: &StepCompletion) -> Result<AgentStep>;

    async fn record_conversation_turn(
        &self,
        session_id: &str,
        agent_index: usize,
        entry: ConversationEntry,
    ) -> Result<()>;

    /// Insert or replace a supervisor turn (by id).
    async fn save_supervisor_turn(&self, turn: &SupervisorTurn) -> Result<()>;
}
