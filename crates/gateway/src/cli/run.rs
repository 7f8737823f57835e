//! `chainstream run`: one-shot execution.
//!
//! Creates a throwaway one-step session in memory, runs the prompt through
//! the same pipeline the HTTP server uses and prints tokens to stdout as
//! they arrive. Thinking goes to stderr, dimmed.

use std::io::Write;
use std::sync::Arc;

use cs_domain::config::Config;
use cs_domain::step::StepDraft;

use crate::bootstrap::{self, StoreMode};
use crate::runtime::{execute_step, ExecuteRequest, StepOutcome};
use crate::sse::{CollectSink, Sink, SinkClosed, WireEvent};

/// Writes events to the terminal as they arrive.
struct TerminalSink;

#[async_trait::async_trait]
impl Sink for TerminalSink {
    async fn push(&mut self, event: WireEvent) -> Result<(), SinkClosed> {
        match event {
            WireEvent::Token { content, .. } => {
                print!("{content}");
                std::io::stdout().flush().ok();
            }
            WireEvent::Thinking { content, .. } => {
                eprint!("\x1b[2m{content}\x1b[0m");
                std::io::stderr().flush().ok();
            }
            WireEvent::Complete {
                was_skipped,
                skip_reason,
                estimated_cost,
                ..
            } => {
                println!();
                if was_skipped {
                    eprintln!("skipped: {}", skip_reason.unwrap_or_default());
                } else if let Some(cost) = estimated_cost {
                    eprintln!("\x1b[2m[estimated cost: ${cost:.6}]\x1b[0m");
                }
            }
            WireEvent::Error { message, .. } => eprintln!("error: {message}"),
            _ => {}
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

pub async fn run(
    config: Arc<Config>,
    prompt: String,
    model: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let model = model.unwrap_or_else(|| config.supervisor.model.clone());
    let state = bootstrap::build_app_state(config, StoreMode::Memory)?;
    if state.llm.resolve(&model).is_none() {
        anyhow::bail!("no provider configured for model {model}");
    }

    let session = state
        .runtime
        .store
        .create_session(
            Some("cli run".into()),
            vec![StepDraft {
                model: model.clone(),
                prompt: prompt.clone(),
                ..Default::default()
            }],
        )
        .await?;
    let step = session
        .steps
        .first()
        .ok_or_else(|| anyhow::anyhow!("session was created without a step"))?;
    let req = ExecuteRequest::from_step(step);
    crate::api::execute::validate_request(&req, &state.config)?;

    let rt = &state.runtime;
    let queue = rt.new_queue();
    let outcome = if json_output {
        let mut sink = CollectSink::default();
        let outcome = execute_step(rt, &queue, &mut sink, req).await?;
        sink.close().await;
        let json = serde_json::to_string_pretty(&sink.events)
            .map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
        outcome
    } else {
        execute_step(rt, &queue, &mut TerminalSink, req).await?
    };
    queue.flush().await;

    match outcome {
        StepOutcome::Failed { message } => anyhow::bail!(message),
        _ => Ok(()),
    }
}
