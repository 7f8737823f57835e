//! Thinking-phase state machine for one step execution.
//!
//! `Idle → Thinking(phase 0..N-1) → Responding → Complete`
//!
//! While the provider has not produced visible content, the manager walks a
//! family-specific list of scripted phases, yielding each as a thinking
//! chunk and queueing a durable thinking update. The first content chunk
//! preempts the remaining phases: the pending phase sleep is dropped and the
//! manager moves straight to `Responding`.
//!
//! When the adapter reports a genuine reasoning trace, the scripted phases
//! stop and the real text is relayed instead, regrouped into whole
//! sentences of roughly `real_chunk_chars` characters.
//!
//! Visible content is written to the store through a latest-value channel
//! drained by one writer task, so the wire never waits on the store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use cs_domain::capability::ModelFamily;
use cs_domain::config::ThinkingConfig;
use cs_domain::step::StepPatch;
use cs_domain::stream::{BoxStream, Chunk};
use cs_store::StepStore;

use super::persist_queue::{PersistenceQueue, UpdateKind};
use super::scheduler::Scheduler;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phases
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingPhase {
    pub text: &'static str,
    pub duration: Duration,
}

const ANTHROPIC_PHASES: &[(&str, u64)] = &[
    ("Reading the request and pinning down what is actually being asked.", 900),
    ("Recalling relevant context and weighing a few possible approaches.", 1400),
    ("Checking the strongest approach for gaps and edge cases.", 1200),
    ("Organizing the answer so it reads clearly.", 800),
];

const OPENAI_PHASES: &[(&str, u64)] = &[
    ("Parsing the prompt.", 600),
    ("Gathering the relevant facts.", 1000),
    ("Drafting a response.", 900),
];

const OPENAI_REASONING_PHASES: &[(&str, u64)] = &[
    ("Breaking the problem into smaller parts.", 1500),
    ("Working through each part step by step.", 2500),
    ("Verifying intermediate results.", 2000),
    ("Consolidating the reasoning into a final answer.", 1500),
];

const GOOGLE_PHASES: &[(&str, u64)] = &[
    ("Understanding the question.", 700),
    ("Exploring related information.", 1100),
    ("Putting the response together.", 800),
];

const XAI_PHASES: &[(&str, u64)] = &[
    ("Sizing up the question.", 700),
    ("Looking at it from a couple of angles.", 1200),
    ("Picking the most useful take.", 900),
];

const DEEPSEEK_PHASES: &[(&str, u64)] = &[
    ("Analyzing the input.", 800),
    ("Reasoning through the details.", 1600),
    ("Double-checking the conclusion.", 1100),
];

const GENERIC_PHASES: &[(&str, u64)] = &[
    ("Thinking about the request.", 800),
    ("Preparing a response.", 1000),
];

/// Scripted phases for a provider family, durations scaled by `scale`.
pub fn phases_for(family: ModelFamily, scale: f64) -> Vec<ThinkingPhase> {
    let table = match family {
        ModelFamily::Anthropic => ANTHROPIC_PHASES,
        ModelFamily::OpenAi => OPENAI_PHASES,
        ModelFamily::OpenAiReasoning => OPENAI_REASONING_PHASES,
        ModelFamily::Google => GOOGLE_PHASES,
        ModelFamily::Xai => XAI_PHASES,
        ModelFamily::DeepSeek => DEEPSEEK_PHASES,
        ModelFamily::Generic => GENERIC_PHASES,
    };
    let scale = if scale.is_finite() && scale >= 0.0 { scale } else { 1.0 };
    table
        .iter()
        .map(|&(text, ms)| ThinkingPhase {
            text,
            duration: Duration::from_millis((ms as f64 * scale) as u64),
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingStatus {
    Idle,
    Thinking { phase: usize },
    Responding,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ThinkingState {
    pub phases: Vec<ThinkingPhase>,
    pub current_phase: usize,
    pub is_active: bool,
    pub full_content: String,
    pub start_time: Option<Instant>,
    pub provider: ModelFamily,
    pub model_type: String,
    pub status: ThinkingStatus,
    /// A genuine reasoning trace replaced the scripted phases.
    pub relaying: bool,
}

/// What a manager needs from the rest of the runtime.
#[derive(Clone)]
pub struct ThinkingDeps {
    pub queue: PersistenceQueue,
    pub store: Arc<dyn StepStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub config: ThinkingConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ThinkingManager {
    step_id: String,
    state: ThinkingState,
    deps: ThinkingDeps,
    content: String,
    content_tx: Option<watch::Sender<String>>,
    writer: Option<JoinHandle<()>>,
    /// The final thinking write has been queued.
    finalized: bool,
    cleaned_up: bool,
}

type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Wake {
    Upstream(Option<Chunk>),
    PhaseElapsed,
}

impl ThinkingManager {
    pub fn new(step_id: impl Into<String>, model: &str, deps: ThinkingDeps) -> Self {
        let provider = ModelFamily::of(model);
        Self {
            step_id: step_id.into(),
            state: ThinkingState {
                phases: Vec::new(),
                current_phase: 0,
                is_active: false,
                full_content: String::new(),
                start_time: None,
                provider,
                model_type: model.to_owned(),
                status: ThinkingStatus::Idle,
                relaying: false,
            },
            deps,
            content: String::new(),
            content_tx: None,
            writer: None,
            finalized: false,
            cleaned_up: false,
        }
    }

    /// Load the phase script, mark the step as thinking and start the
    /// content writer.
    pub fn start(&mut self) {
        if self.state.status != ThinkingStatus::Idle {
            return;
        }
        if self.deps.config.simulate {
            self.state.phases = phases_for(self.state.provider, self.deps.config.phase_scale);
        }
        self.state.is_active = true;
        self.state.start_time = Some(Instant::now());
        self.state.status = ThinkingStatus::Thinking { phase: 0 };

        self.queue_thinking(true);

        let (tx, rx) = watch::channel(String::new());
        self.content_tx = Some(tx);
        self.writer = Some(spawn_content_writer(
            self.step_id.clone(),
            Arc::clone(&self.deps.store),
            rx,
        ));

        tracing::debug!(
            step_id = %self.step_id,
            family = self.state.provider.as_str(),
            phases = self.state.phases.len(),
            "thinking started"
        );
    }

    pub fn state(&self) -> &ThinkingState {
        &self.state
    }

    /// Accumulated thinking text, scripted or relayed.
    pub fn thinking_text(&self) -> &str {
        &self.state.full_content
    }

    /// Wrap the adapter's chunk stream.
    ///
    /// Yields scripted or relayed `Thinking` chunks, then `Content` chunks,
    /// and ends with the upstream terminal chunk. An upstream that ends
    /// without a terminal chunk yields an `Error`.
    pub fn drive<'a>(
        &'a mut self,
        mut upstream: BoxStream<'static, Chunk>,
    ) -> impl Stream<Item = Chunk> + Send + 'a {
        async_stream::stream! {
            let mut relay = SentenceChunker::new(self.deps.config.real_chunk_chars);
            let mut sleep: Option<Sleep> = None;

            loop {
                if self.scripted_phase_pending() {
                    if sleep.is_none() {
                        let phase = self.state.phases[self.state.current_phase].clone();
                        let text = self.append_thinking(phase.text);
                        self.queue_thinking(true);
                        yield Chunk::Thinking { text };
                        let scheduler = Arc::clone(&self.deps.scheduler);
                        sleep = Some(Box::pin(async move { scheduler.sleep(phase.duration).await }));
                    }
                }

                let wake = match sleep.as_mut() {
                    Some(timer) => tokio::select! {
                        chunk = upstream.next() => Wake::Upstream(chunk),
                        _ = timer => Wake::PhaseElapsed,
                    },
                    None => Wake::Upstream(upstream.next().await),
                };

                let chunk = match wake {
                    Wake::PhaseElapsed => {
                        sleep = None;
                        self.advance_phase();
                        continue;
                    }
                    Wake::Upstream(chunk) => chunk,
                };

                match chunk {
                    Some(Chunk::Thinking { text }) => {
                        sleep = None;
                        if !self.state.relaying {
                            self.state.relaying = true;
                            if !self.state.full_content.is_empty() {
                                self.state.full_content.push_str("\n\n");
                            }
                        }
                        for piece in relay.push(&text) {
                            let piece = self.append_thinking(&piece);
                            self.queue_thinking_text();
                            yield Chunk::Thinking { text: piece };
                        }
                    }
                    Some(Chunk::Content { text }) => {
                        sleep = None;
                        if let Some(rest) = relay.flush() {
                            let rest = self.append_thinking(&rest);
                            self.queue_thinking_text();
                            yield Chunk::Thinking { text: rest };
                        }
                        if matches!(self.state.status, ThinkingStatus::Thinking { .. }) {
                            self.complete_thinking(None);
                            self.state.status = ThinkingStatus::Responding;
                        }
                        self.content.push_str(&text);
                        let full = self.content.clone();
                        self.update_stream_content(&full);
                        yield Chunk::Content { text };
                    }
                    Some(terminal @ Chunk::Complete { .. }) | Some(terminal @ Chunk::Error { .. }) => {
                        drop(sleep.take());
                        if let Some(rest) = relay.flush() {
                            let rest = self.append_thinking(&rest);
                            self.queue_thinking_text();
                            yield Chunk::Thinking { text: rest };
                        }
                        self.complete_thinking(None);
                        self.state.status = ThinkingStatus::Complete;
                        yield terminal;
                        return;
                    }
                    None => {
                        drop(sleep.take());
                        self.complete_thinking(None);
                        self.state.status = ThinkingStatus::Complete;
                        yield Chunk::Error {
                            message: "stream ended before completion".into(),
                        };
                        return;
                    }
                }
            }
        }
    }

    /// Replace the step's in-flight text. Goes straight to the content
    /// writer; only the newest value is written if the store falls behind.
    pub fn update_stream_content(&self, full_text: &str) {
        if let Some(tx) = &self.content_tx {
            tx.send_replace(full_text.to_owned());
        }
    }

    /// End the thinking display and queue the final thinking text.
    ///
    /// Only the first call has an effect.
    pub fn complete_thinking(&mut self, final_text: Option<&str>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.state.is_active = false;
        if let Some(text) = final_text {
            self.state.full_content = text.to_owned();
        }
        self.queue_thinking(false);

        if let Some(start) = self.state.start_time {
            tracing::debug!(
                step_id = %self.step_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                phases_shown = self.state.current_phase,
                relayed = self.state.relaying,
                "thinking finished"
            );
        }
    }

    /// Stop timers and let the content writer drain. Safe to call more
    /// than once.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if self.state.status != ThinkingStatus::Idle {
            self.complete_thinking(None);
        }
        self.state.status = ThinkingStatus::Complete;

        // Dropping the sender lets the writer finish its last value and exit.
        self.content_tx = None;
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                tracing::warn!(step_id = %self.step_id, error = %e, "content writer task failed");
            }
        }
    }

    fn scripted_phase_pending(&self) -> bool {
        matches!(self.state.status, ThinkingStatus::Thinking { .. })
            && !self.state.relaying
            && self.state.current_phase < self.state.phases.len()
    }

    fn advance_phase(&mut self) {
        self.state.current_phase += 1;
        if self.state.current_phase < self.state.phases.len() {
            self.state.status = ThinkingStatus::Thinking {
                phase: self.state.current_phase,
            };
        }
    }

    /// Append a piece to the thinking text and return it as emitted.
    fn append_thinking(&mut self, piece: &str) -> String {
        if !self.state.full_content.is_empty() && !self.state.full_content.ends_with('\n') {
            self.state.full_content.push(' ');
        }
        self.state.full_content.push_str(piece);
        piece.to_owned()
    }

    /// Queue the current thinking text. `isThinking` stays false once the
    /// thinking display has ended.
    fn queue_thinking_text(&self) {
        self.queue_thinking(!self.finalized);
    }

    fn queue_thinking(&self, active: bool) {
        self.deps.queue.enqueue(
            UpdateKind::Thinking,
            &self.step_id,
            StepPatch {
                thinking: Some(self.state.full_content.clone()),
                is_thinking: Some(active),
                ..Default::default()
            },
        );
    }
}

impl Drop for ThinkingManager {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

fn spawn_content_writer(
    step_id: String,
    store: Arc<dyn StepStore>,
    mut rx: watch::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let text = rx.borrow_and_update().clone();
            if let Err(e) = store.update_streamed_content(&step_id, &text).await {
                tracing::warn!(step_id = %step_id, error = %e, "streamed content write failed");
            }
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sentence chunker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Regroups a streamed reasoning trace into pieces of whole sentences.
///
/// A piece is released once the next complete sentence would push it past
/// `target` characters. A single sentence longer than `target` is released
/// on its own.
#[derive(Debug)]
pub struct SentenceChunker {
    buf: String,
    target: usize,
}

impl SentenceChunker {
    pub fn new(target: usize) -> Self {
        Self {
            buf: String::new(),
            target: target.max(1),
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut out = Vec::new();

        loop {
            let ends = sentence_ends(&self.buf);
            let Some(&last) = ends.last() else {
                break;
            };
            if self.buf[..last].chars().count() <= self.target {
                break;
            }
            let cut = ends
                .iter()
                .copied()
                .take_while(|&e| self.buf[..e].chars().count() <= self.target)
                .last()
                .unwrap_or(ends[0]);
            let piece = self.buf[..cut].trim().to_owned();
            self.buf.drain(..cut);
            if !piece.is_empty() {
                out.push(piece);
            }
        }
        out
    }

    /// Release whatever is buffered.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_owned())
    }
}

/// Byte offsets just past each complete sentence in `text`.
fn sentence_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = i + c.len_utf8();
        match c {
            '\n' => ends.push(end),
            '.' | '!' | '?' => {
                if chars.peek().is_some_and(|&(_, next)| next.is_whitespace()) {
                    ends.push(end);
                }
            }
            _ => {}
        }
    }
    ends
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
