#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cs_domain::capability::LlmCapabilities;
use cs_domain::config::Config;
use cs_domain::error::{Error, Result};
use cs_domain::stream::{BoxStream, StreamEvent, Usage};
use cs_gateway::runtime::scheduler::InstantScheduler;
use cs_gateway::runtime::Runtime;
use cs_gateway::sse::{Sink, SinkClosed, WireEvent};
use cs_providers::{ChatRequest, LlmProvider, ProviderRegistry, StreamAdapter};
use cs_store::{JsonStepStore, StepStore};

/// Serves every `mock*` model. Models containing `broken` fail before the
/// first byte; models containing `supervisor` answer with a fixed reply.
pub struct MockProvider {
    caps: LlmCapabilities,
    supervisor_reply: String,
}

impl MockProvider {
    pub fn new(supervisor_reply: &str) -> Self {
        Self {
            caps: LlmCapabilities::default(),
            supervisor_reply: supervisor_reply.to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn supports(&self, model: &str) -> bool {
        model.starts_with("mock")
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = req.model.unwrap_or_default();
        if model.contains("broken") {
            return Err(Error::Provider {
                provider: "mock".into(),
                message: "HTTP 500 - upstream exploded".into(),
            });
        }
        let text = if model.contains("supervisor") {
            self.supervisor_reply.clone()
        } else {
            format!("Answer from {model}. All done.")
        };

        let words: Vec<String> = text.split_inclusive(' ').map(str::to_owned).collect();
        let completion = words.len() as u32;
        let mut events: Vec<Result<StreamEvent>> = words
            .into_iter()
            .map(|text| Ok(StreamEvent::Token { text }))
            .collect();
        events.push(Ok(StreamEvent::Done {
            usage: Some(Usage::new(12, completion)),
            finish_reason: Some("stop".into()),
        }));
        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.caps
    }

    fn provider_id(&self) -> &str {
        "mock"
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.supervisor.model = "mock-supervisor".into();
    config
}

pub fn registry(supervisor_reply: &str) -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::with_providers(vec![
        Arc::new(MockProvider::new(supervisor_reply)) as Arc<dyn LlmProvider>,
    ]))
}

/// A runtime over an in-memory store that never waits on real time.
pub fn runtime(config: &Config, supervisor_reply: &str) -> (Runtime, Arc<JsonStepStore>) {
    let json_store = Arc::new(JsonStepStore::in_memory());
    let store: Arc<dyn StepStore> = json_store.clone();
    let adapter = StreamAdapter::new(registry(supervisor_reply), 1024, 0.7);
    let runtime = Runtime::new(config, store, adapter, Arc::new(InstantScheduler));
    (runtime, json_store)
}

/// A reader that goes away after `budget` events. Clones share the budget,
/// like clones of one HTTP response sink.
#[derive(Clone)]
pub struct HangupSink {
    budget: Arc<AtomicUsize>,
    pub events: Arc<Mutex<Vec<WireEvent>>>,
}

impl HangupSink {
    pub fn after(budget: usize) -> Self {
        Self {
            budget: Arc::new(AtomicUsize::new(budget)),
            events: Arc::default(),
        }
    }

    pub fn count(&self, type_name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.type_name() == type_name)
            .count()
    }
}

#[async_trait::async_trait]
impl Sink for HangupSink {
    async fn push(&mut self, event: WireEvent) -> std::result::Result<(), SinkClosed> {
        let admitted = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !admitted {
            return Err(SinkClosed);
        }
        self.events.lock().push(event);
        Ok(())
    }

    async fn close(&mut self) {}
}
