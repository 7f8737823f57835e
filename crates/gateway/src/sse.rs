//! Server-sent event encoding and the sink abstraction the runtime writes to.
//!
//! Every event goes out as `data: <json>\n\n`; a response ends with
//! `data: [DONE]\n\n`. The runtime only sees [`Sink`]: HTTP responses use
//! [`ChannelSink`], the CLI and tests use their own collectors.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_core::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use cs_domain::step::MentionTask;
use cs_domain::stream::Usage;

pub const DONE: &str = "[DONE]";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireEvent {
    Token {
        step_id: String,
        content: String,
    },
    Thinking {
        step_id: String,
        content: String,
    },
    Complete {
        step_id: String,
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_cost: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_duration: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_per_second: Option<f64>,
        was_skipped: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        message: String,
    },
    SupervisorTurnStart {
        turn_id: String,
        session_id: String,
    },
    SupervisorChunk {
        turn_id: String,
        content: String,
    },
    InvalidMentions {
        mentions: Vec<String>,
    },
    MentionExecutionStart {
        step_id: String,
        agent_index: usize,
        agent_name: String,
        task_prompt: String,
    },
    AgentExecutionInternal {
        step_id: String,
        agent_index: usize,
        /// `token` or `thinking`.
        kind: String,
        content: String,
    },
    AgentExecutionComplete {
        step_id: String,
        agent_index: usize,
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_cost: Option<f64>,
    },
    AgentExecutionError {
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        agent_index: usize,
        message: String,
    },
    SupervisorComplete {
        turn_id: String,
        response: String,
        mentions: Vec<MentionTask>,
        executed_step_ids: Vec<String>,
        outcomes: Vec<MentionOutcome>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WireEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireEvent::Token { .. } => "token",
            WireEvent::Thinking { .. } => "thinking",
            WireEvent::Complete { .. } => "complete",
            WireEvent::Error { .. } => "error",
            WireEvent::SupervisorTurnStart { .. } => "supervisor_turn_start",
            WireEvent::SupervisorChunk { .. } => "supervisor_chunk",
            WireEvent::InvalidMentions { .. } => "invalid_mentions",
            WireEvent::MentionExecutionStart { .. } => "mention_execution_start",
            WireEvent::AgentExecutionInternal { .. } => "agent_execution_internal",
            WireEvent::AgentExecutionComplete { .. } => "agent_execution_complete",
            WireEvent::AgentExecutionError { .. } => "agent_execution_error",
            WireEvent::SupervisorComplete { .. } => "supervisor_complete",
        }
    }
}

/// Result of one delegated mention.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MentionOutcome {
    Completed {
        agent_index: usize,
        step_id: String,
    },
    Failed {
        agent_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        error: String,
    },
    /// The client went away before this mention ran.
    NotRun { agent_index: usize },
}

impl MentionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, MentionOutcome::Failed { .. })
    }
}

/// JSON payload of one event (the part after `data: `).
pub fn encode(event: &WireEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::warn!(event = event.type_name(), error = %e, "failed to serialize SSE event");
        format!(r#"{{"type":"error","message":"failed to encode {} event"}}"#, event.type_name())
    })
}

/// One complete wire frame.
pub fn frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sinks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The reader went away; the producer should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

#[async_trait::async_trait]
pub trait Sink: Send {
    /// Deliver one event, waiting for room if the reader is slow.
    async fn push(&mut self, event: WireEvent) -> Result<(), SinkClosed>;

    /// Write the end-of-stream marker. Further pushes fail.
    async fn close(&mut self);

    /// Report a failure as an `error` event, then close.
    async fn fail(&mut self, message: String) {
        let _ = self
            .push(WireEvent::Error {
                step_id: None,
                message,
            })
            .await;
        self.close().await;
    }
}

/// Feeds an HTTP response body through a bounded channel of JSON payloads.
///
/// Clones share the channel, so concurrent pipelines can multiplex onto one
/// response; the owner closes it once.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
    closed: bool,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.clamp(1, 64));
        (Self { tx, closed: false }, rx)
    }
}

#[async_trait::async_trait]
impl Sink for ChannelSink {
    async fn push(&mut self, event: WireEvent) -> Result<(), SinkClosed> {
        if self.closed {
            return Err(SinkClosed);
        }
        self.tx.send(encode(&event)).await.map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send(DONE.to_owned()).await;
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub events: Vec<WireEvent>,
    pub closed: bool,
}

impl CollectSink {
    /// The response body as it would appear on the wire.
    pub fn to_wire(&self) -> String {
        let mut out: String = self.events.iter().map(|e| frame(&encode(e))).collect();
        if self.closed {
            out.push_str(&frame(DONE));
        }
        out
    }

    pub fn count(&self, type_name: &str) -> usize {
        self.events.iter().filter(|e| e.type_name() == type_name).count()
    }
}

#[async_trait::async_trait]
impl Sink for CollectSink {
    async fn push(&mut self, event: WireEvent) -> Result<(), SinkClosed> {
        if self.closed {
            return Err(SinkClosed);
        }
        self.events.push(event);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Turn a [`ChannelSink`] receiver into an axum SSE response body.
pub fn sse_body(
    mut rx: mpsc::Receiver<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(payload) = rx.recv().await {
            let done = payload == DONE;
            yield Ok(Event::default().data(payload));
            if done {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
