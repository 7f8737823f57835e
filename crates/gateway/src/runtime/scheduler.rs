//! Timer source for scripted thinking phases.
//!
//! Production code sleeps on the tokio clock; tests swap in
//! [`InstantScheduler`] so phase timing never makes a test slow or flaky.

use std::time::Duration;

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait::async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Completes every sleep after a single yield.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantScheduler;

#[async_trait::async_trait]
impl Scheduler for InstantScheduler {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}
