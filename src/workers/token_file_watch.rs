use crate::adapters::push::FileTokenSource;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct TokenFileWatchWorker {
    source: Arc<FileTokenSource>,
    interval: Duration,
}

impl TokenFileWatchWorker {
    #[must_use]
    pub const fn new(source: Arc<FileTokenSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    match self.source.poll().await {
                        Ok(true) => tracing::debug!(path = %self.source.path().display(), "Token file changed"),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "Failed to read token file"),
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Token file watch loop shutting down...");
    }
}
