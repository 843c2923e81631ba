use crate::services::{RetryScheduler, TokenStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Safety net for tokens that fell through every event path: flushes a record
/// whose last write failed and attempts any unregistered token that has no
/// retry armed.
#[derive(Debug)]
pub struct RetrySweepWorker {
    scheduler: Arc<RetryScheduler>,
    store: TokenStore,
    interval: Duration,
}

impl RetrySweepWorker {
    #[must_use]
    pub const fn new(scheduler: Arc<RetryScheduler>, store: TokenStore, interval: Duration) -> Self {
        Self { scheduler, store, interval }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; cold start covers that moment
        interval.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().instrument(tracing::debug_span!("retry_sweep_iteration")).await;
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Retry sweep loop shutting down...");
    }

    async fn sweep(&self) {
        if let Err(e) = self.store.flush().await {
            tracing::warn!(error = %e, "Token record still not persisted");
        }

        if let Some(result) = self.scheduler.sweep().await {
            tracing::info!(?result, "Sweep attempted pending registration");
        }
    }
}
