//! JSON-file backed step store.
//!
//! All sessions live in memory behind one `RwLock`; the whole state is
//! written to a single JSON file on [`JsonStepStore::flush`] (periodically
//! from a background task and once at shutdown). Writes go to a temp file
//! first and are renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use cs_domain::error::{Error, Result};
use cs_domain::step::{
    AgentStep, ConversationEntry, Session, StepCompletion, StepDraft, StepPatch, SupervisorTurn,
};
use cs_domain::trace::TraceEvent;

use crate::{SessionSummary, StepStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    sessions: HashMap<String, Session>,
    /// step id → session id. Rebuilt on load.
    #[serde(skip)]
    step_owner: HashMap<String, String>,
}

impl StoreState {
    fn reindex(&mut self) {
        self.step_owner = self
            .sessions
            .values()
            .flat_map(|s| s.steps.iter().map(|st| (st.id.clone(), s.id.clone())))
            .collect();
    }

    fn step_mut(&mut self, step_id: &str) -> Result<(&mut Session, usize)> {
        let session_id = self
            .step_owner
            .get(step_id)
            .ok_or_else(|| Error::NotFound(format!("step {step_id}")))?;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let idx = session
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| Error::NotFound(format!("step {step_id}")))?;
        Ok((session, idx))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct JsonStepStore {
    /// `None` keeps everything in memory (tests, one-shot CLI runs).
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
    dirty: AtomicBool,
}

impl JsonStepStore {
    /// Load the store from `path`, or start empty if the file is missing.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let mut state: StoreState = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| {
                Error::Persistence(format!("corrupt state file {}: {e}", path.display()))
            })?
        } else {
            StoreState::default()
        };
        state.reindex();

        tracing::info!(
            sessions = state.sessions.len(),
            steps = state.step_owner.len(),
            path = %path.display(),
            "step store loaded"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Persist the current state if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let json = {
            let state = self.state.read();
            serde_json::to_string_pretty(&*state)
                .map_err(|e| Error::Persistence(format!("serializing state: {e}")))?
        };
        let tmp = path.with_extension("json.tmp");
        let written = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, path));
        if let Err(e) = written {
            self.dirty.store(true, Ordering::Release);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Flush every `interval` until the returned handle is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush() {
                    tracing::warn!(error = %e, "periodic store flush failed");
                }
            }
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn with_step<T>(
        &self,
        step_id: &str,
        f: impl FnOnce(&mut AgentStep) -> T,
    ) -> Result<T> {
        let mut state = self.state.write();
        let (session, idx) = state.step_mut(step_id)?;
        let out = f(&mut session.steps[idx]);
        session.updated_at = Utc::now();
        drop(state);
        self.mark_dirty();
        Ok(out)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StepStore impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl StepStore for JsonStepStore {
    async fn create_session(&self, name: Option<String>, steps: Vec<StepDraft>) -> Result<Session> {
        let now = Utc::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let steps: Vec<AgentStep> = steps
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                let index = draft.index.unwrap_or(i);
                AgentStep::from_draft(uuid::Uuid::new_v4().to_string(), session_id.clone(), index, draft)
            })
            .collect();

        let session = Session {
            id: session_id.clone(),
            name,
            steps,
            supervisor_turns: Vec::new(),
            conversation_history: Default::default(),
            created_at: now,
            updated_at: now,
        };

        {
            let mut state = self.state.write();
            for step in &session.steps {
                state.step_owner.insert(step.id.clone(), session_id.clone());
            }
            state.sessions.insert(session_id.clone(), session.clone());
        }
        self.mark_dirty();

        TraceEvent::SessionCreated {
            session_id,
            steps: session.steps.len(),
        }
        .emit();

        Ok(session)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let state = self.state.read();
        let mut out: Vec<SessionSummary> = state
            .sessions
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                name: s.name.clone(),
                steps: s.steps.len(),
                supervisor_turns: s.supervisor_turns.len(),
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.state.read().sessions.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let removed = {
            let mut state = self.state.write();
            match state.sessions.remove(session_id) {
                Some(session) => {
                    for step in &session.steps {
                        state.step_owner.remove(&step.id);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.mark_dirty();
            TraceEvent::SessionDeleted {
                session_id: session_id.to_owned(),
            }
            .emit();
        }
        Ok(removed)
    }

    async fn create_step(&self, session_id: &str, draft: StepDraft) -> Result<String> {
        let step_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.write();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            let index = draft.index.unwrap_or_else(|| {
                session.steps.iter().map(|s| s.index + 1).max().unwrap_or(0)
            });
            session.steps.push(AgentStep::from_draft(
                step_id.clone(),
                session_id.to_owned(),
                index,
                draft,
            ));
            session.steps.sort_by_key(|s| s.index);
            session.updated_at = Utc::now();
            state.step_owner.insert(step_id.clone(), session_id.to_owned());
        }
        self.mark_dirty();
        Ok(step_id)
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<AgentStep>> {
        let state = self.state.read();
        Ok(state
            .step_owner
            .get(step_id)
            .and_then(|sid| state.sessions.get(sid))
            .and_then(|s| s.step(step_id))
            .cloned())
    }

    async fn begin_execution(&self, step_id: &str, model: &str, prompt: &str) -> Result<AgentStep> {
        self.with_step(step_id, |step| {
            step.begin_execution(model, prompt, Utc::now());
            step.clone()
        })
    }

    async fn update_step(&self, step_id: &str, patch: &StepPatch) -> Result<()> {
        let applied = self.with_step(step_id, |step| step.apply(patch))?;
        if !applied {
            tracing::debug!(step_id, "ignored update to a completed step");
        }
        Ok(())
    }

    async fn update_streamed_content(&self, step_id: &str, full_text: &str) -> Result<()> {
        self.with_step(step_id, |step| step.set_streamed_content(full_text))?;
        Ok(())
    }

    async fn complete_execution(&self, step_id: &str, done: &StepCompletion) -> Result<AgentStep> {
        let (applied, step) = self.with_step(step_id, |step| {
            let applied = step.complete(done, Utc::now());
            (applied, step.clone())
        })?;
        if !applied {
            tracing::warn!(step_id, "step already complete, final fields not overwritten");
        }
        Ok(step)
    }

    async fn record_conversation_turn(
        &self,
        session_id: &str,
        agent_index: usize,
        entry: ConversationEntry,
    ) -> Result<()> {
        {
            let mut state = self.state.write();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            session
                .conversation_history
                .entry(agent_index)
                .or_default()
                .push(entry);
            session.updated_at = Utc::now();
        }
        self.mark_dirty();
        Ok(())
    }

    async fn save_supervisor_turn(&self, turn: &SupervisorTurn) -> Result<()> {
        {
            let mut state = self.state.write();
            let session = state
                .sessions
                .get_mut(&turn.session_id)
                .ok_or_else(|| Error::NotFound(format!("session {}", turn.session_id)))?;
            match session.supervisor_turns.iter_mut().find(|t| t.id == turn.id) {
                Some(existing) if existing.is_complete => {
                    tracing::debug!(turn_id = %turn.id, "ignored update to a completed turn");
                }
                Some(existing) => *existing = turn.clone(),
                None => session.supervisor_turns.push(turn.clone()),
            }
            session.updated_at = Utc::now();
        }
        self.mark_dirty();
        Ok(())
    }
}
