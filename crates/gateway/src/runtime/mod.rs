//! Execution runtime: everything between an accepted request and the SSE
//! sink.

pub mod condition;
pub mod execute;
pub mod mentions;
pub mod persist_queue;
pub mod rate_limit;
pub mod scheduler;
pub mod supervisor;
pub mod thinking;

use std::sync::Arc;

use cs_domain::config::{Config, PersistenceConfig, SupervisorConfig, ThinkingConfig};
use cs_domain::pricing::PriceTable;
use cs_providers::StreamAdapter;
use cs_store::StepStore;

use self::persist_queue::PersistenceQueue;
use self::scheduler::Scheduler;
use self::thinking::ThinkingDeps;

pub use self::execute::{execute_step, run_parallel, ExecuteRequest, StepOutcome};
pub use self::supervisor::{run_supervisor_turn, SupervisorRequest, SupervisorSummary};

/// Shared services every pipeline runs against. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<dyn StepStore>,
    pub adapter: StreamAdapter,
    pub scheduler: Arc<dyn Scheduler>,
    pub prices: Arc<PriceTable>,
    pub thinking: ThinkingConfig,
    pub persistence: PersistenceConfig,
    pub supervisor: SupervisorConfig,
}

impl Runtime {
    pub fn new(
        config: &Config,
        store: Arc<dyn StepStore>,
        adapter: StreamAdapter,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            store,
            adapter,
            scheduler,
            prices: Arc::new(PriceTable::new(config.llm.pricing.clone())),
            thinking: config.thinking.clone(),
            persistence: config.persistence.clone(),
            supervisor: config.supervisor.clone(),
        }
    }

    /// A fresh write-behind queue for one response.
    pub fn new_queue(&self) -> PersistenceQueue {
        PersistenceQueue::new(Arc::clone(&self.store), &self.persistence)
    }

    pub(crate) fn thinking_deps(&self, queue: &PersistenceQueue) -> ThinkingDeps {
        ThinkingDeps {
            queue: queue.clone(),
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
            config: self.thinking.clone(),
        }
    }
}
