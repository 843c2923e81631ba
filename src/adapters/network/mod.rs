use crate::domain::events::NetworkState;
use tokio::sync::watch;

/// Connectivity signal. Receivers observe every change of [`NetworkState`].
pub trait ReachabilitySource: Send + Sync + std::fmt::Debug {
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// Reachability fed by whoever owns the connectivity information: a platform
/// callback bridge, or the TCP probe worker.
#[derive(Debug)]
pub struct WatchReachability {
    tx: watch::Sender<NetworkState>,
}

impl WatchReachability {
    #[must_use]
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publishes `state`. Subscribers are only woken if it differs from the current one.
    pub fn set(&self, state: NetworkState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    #[must_use]
    pub fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }
}

impl Default for WatchReachability {
    fn default() -> Self {
        Self::new(NetworkState::online())
    }
}

impl ReachabilitySource for WatchReachability {
    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
