use crate::domain::events::AppState;
use tokio::sync::broadcast;

/// App foreground/background transitions.
pub trait LifecycleEvents: Send + Sync + std::fmt::Debug {
    fn subscribe(&self) -> broadcast::Receiver<AppState>;
}

/// In-process lifecycle event bus. The host's app-state callback calls [`LifecycleBus::emit`].
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    tx: broadcast::Sender<AppState>,
}

impl LifecycleBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns how many subscribers saw the event.
    pub fn emit(&self, state: AppState) -> usize {
        self.tx.send(state).unwrap_or(0)
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(16)
    }
}

impl LifecycleEvents for LifecycleBus {
    fn subscribe(&self) -> broadcast::Receiver<AppState> {
        self.tx.subscribe()
    }
}
