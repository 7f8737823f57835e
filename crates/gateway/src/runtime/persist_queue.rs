//! Write-behind queue for step metadata.
//!
//! One queue lives for the duration of one streamed response. Producers
//! call [`PersistenceQueue::enqueue`] and move on; draining happens on
//! spawned tasks, either after the queue has been idle for the debounce
//! window or as soon as `batch_size` updates are pending. Each drain
//! collapses the batch to one write per `(step, kind)`, keeping the newest
//! payload, and issues the writes concurrently. Failed writes are logged
//! and dropped.
//!
//! The owner awaits [`PersistenceQueue::flush`] once, right before the
//! response closes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use cs_domain::config::PersistenceConfig;
use cs_domain::step::StepPatch;
use cs_domain::trace::TraceEvent;
use cs_store::StepStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which field group an update touches. Updates of the same kind for the
/// same step overwrite each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Thinking,
    Status,
    Metadata,
}

#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub kind: UpdateKind,
    pub step_id: String,
    pub payload: StepPatch,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: usize,
    pub drains: usize,
    pub writes: usize,
    pub failed: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct PersistenceQueue {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StepStore>,
    batch_size: usize,
    debounce: Duration,
    pending: Mutex<VecDeque<PendingUpdate>>,
    /// Serializes drains so batches reach the store in enqueue order.
    drain_lock: tokio::sync::Mutex<()>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<QueueStats>,
}

impl PersistenceQueue {
    pub fn new(store: Arc<dyn StepStore>, config: &PersistenceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                batch_size: config.batch_size.max(1),
                debounce: Duration::from_millis(config.debounce_ms),
                pending: Mutex::new(VecDeque::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                debounce_task: Mutex::new(None),
                stats: Mutex::new(QueueStats::default()),
            }),
        }
    }

    /// Queue an update and schedule a drain. Never waits on the store.
    pub fn enqueue(&self, kind: UpdateKind, step_id: &str, payload: StepPatch) {
        let pending_len = {
            let mut pending = self.inner.pending.lock();
            pending.push_back(PendingUpdate {
                kind,
                step_id: step_id.to_owned(),
                payload,
                enqueued_at: Instant::now(),
            });
            pending.len()
        };
        self.inner.stats.lock().enqueued += 1;

        if pending_len >= self.inner.batch_size {
            self.cancel_debounce();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.drain_once().await;
            });
        } else {
            self.schedule_debounce();
        }
    }

    /// Drain until nothing is pending and no drain is in flight.
    pub async fn flush(&self) {
        self.cancel_debounce();
        while self.inner.drain_once().await > 0 {}
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn stats(&self) -> QueueStats {
        *self.inner.stats.lock()
    }

    fn schedule_debounce(&self) {
        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Detach the drain so a later reschedule (which aborts this
            // task) cannot cut a write short.
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    while inner.drain_once().await > 0 {}
                });
            }
        });
        if let Some(previous) = self.inner.debounce_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_debounce(&self) {
        if let Some(handle) = self.inner.debounce_task.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    /// Run one drain cycle; returns how many queued updates it consumed.
    async fn drain_once(&self) -> usize {
        let _guard = self.drain_lock.lock().await;

        let (taken, writes) = self.take_batch();
        if taken == 0 {
            return 0;
        }

        let results = join_all(
            writes
                .iter()
                .map(|w| self.store.update_step(&w.step_id, &w.payload)),
        )
        .await;

        let mut failed = 0;
        for (write, result) in writes.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                tracing::warn!(
                    step_id = %write.step_id,
                    kind = ?write.kind,
                    error = %e,
                    "persistence write failed, dropping"
                );
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.drains += 1;
            stats.writes += writes.len();
            stats.failed += failed;
        }

        TraceEvent::PersistenceDrain {
            taken,
            writes: writes.len(),
            failed,
        }
        .emit();

        taken
    }

    /// Take up to `batch_size` oldest updates and collapse them per
    /// `(step, kind)`. Updates still pending for a key that made it into
    /// this batch are folded in as well.
    fn take_batch(&self) -> (usize, Vec<PendingUpdate>) {
        let mut pending = self.pending.lock();
        let n = pending.len().min(self.batch_size);

        let mut writes: Vec<PendingUpdate> = Vec::with_capacity(n);
        let mut slots: HashMap<(String, UpdateKind), usize> = HashMap::new();

        for update in pending.drain(..n) {
            let key = (update.step_id.clone(), update.kind);
            match slots.get(&key) {
                Some(&i) => writes[i] = update,
                None => {
                    slots.insert(key, writes.len());
                    writes.push(update);
                }
            }
        }

        let mut absorbed = 0;
        pending.retain(|update| {
            match slots.get(&(update.step_id.clone(), update.kind)) {
                Some(&i) => {
                    writes[i] = update.clone();
                    absorbed += 1;
                    false
                }
                None => true,
            }
        });

        (n + absorbed, writes)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.debounce_task.get_mut().take() {
            handle.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use cs_domain::step::StepDraft;
    use cs_store::JsonStepStore;

    async fn store_with_steps(n: usize) -> (Arc<JsonStepStore>, Vec<String>) {
        let store = Arc::new(JsonStepStore::in_memory());
        let drafts = (0..n)
            .map(|_| StepDraft {
                model: "gpt-4o".into(),
                ..Default::default()
            })
            .collect();
        let session = store.create_session(None, drafts).await.unwrap();
        let ids = session.steps.iter().map(|s| s.id.clone()).collect();
        (store, ids)
    }

    fn thinking(text: &str) -> StepPatch {
        StepPatch {
            thinking: Some(text.into()),
            is_thinking: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fifteen_updates_for_one_step_collapse_to_one_write() {
        let (store, ids) = store_with_steps(1).await;
        let queue = PersistenceQueue::new(store.clone(), &PersistenceConfig::default());

        for i in 0..15 {
            queue.enqueue(UpdateKind::Thinking, &ids[0], thinking(&format!("phase {i}")));
        }
        queue.flush().await;

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 15);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.drains, 1);
        let step = store.get_step(&ids[0]).await.unwrap().unwrap();
        assert_eq!(step.thinking, "phase 14");
    }

    #[tokio::test]
    async fn distinct_kinds_and_steps_are_written_separately() {
        let (store, ids) = store_with_steps(2).await;
        let queue = PersistenceQueue::new(store.clone(), &PersistenceConfig::default());

        queue.enqueue(UpdateKind::Thinking, &ids[0], thinking("a"));
        queue.enqueue(
            UpdateKind::Status,
            &ids[0],
            StepPatch {
                is_streaming: Some(true),
                ..Default::default()
            },
        );
        queue.enqueue(UpdateKind::Thinking, &ids[1], thinking("b"));
        queue.enqueue(UpdateKind::Thinking, &ids[1], thinking("c"));
        queue.flush().await;

        assert_eq!(queue.stats().writes, 3);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(store.get_step(&ids[1]).await.unwrap().unwrap().thinking, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_debounce_drains_without_flush() {
        let (store, ids) = store_with_steps(1).await;
        let queue = PersistenceQueue::new(store.clone(), &PersistenceConfig::default());

        queue.enqueue(UpdateKind::Thinking, &ids[0], thinking("late"));
        assert_eq!(queue.stats().drains, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Let the detached drain task run to completion.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.stats().writes, 1);
        assert_eq!(store.get_step(&ids[0]).await.unwrap().unwrap().thinking, "late");
    }

    #[tokio::test]
    async fn full_batch_drains_without_waiting_for_idle() {
        let (store, ids) = store_with_steps(1).await;
        let config = PersistenceConfig {
            debounce_ms: 60_000,
            ..Default::default()
        };
        let queue = PersistenceQueue::new(store.clone(), &config);
        let batch = config.batch_size;

        for i in 0..batch - 1 {
            queue.enqueue(UpdateKind::Thinking, &ids[0], thinking(&format!("phase {i}")));
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.stats().drains, 0);
        assert_eq!(queue.pending_len(), batch - 1);

        queue.enqueue(UpdateKind::Thinking, &ids[0], thinking("last"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = queue.stats();
        assert_eq!(stats.drains, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(store.get_step(&ids[0]).await.unwrap().unwrap().thinking, "last");
    }

    #[tokio::test]
    async fn failed_writes_are_dropped_not_retried() {
        let store = Arc::new(JsonStepStore::in_memory());
        let queue = PersistenceQueue::new(store, &PersistenceConfig::default());

        queue.enqueue(UpdateKind::Status, "no-such-step", StepPatch::default());
        queue.flush().await;
        queue.flush().await;

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.drains, 1);
        assert_eq!(queue.pending_len(), 0);
    }
}
