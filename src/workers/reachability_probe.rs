use crate::adapters::network::WatchReachability;
use crate::config::{ReachabilityConfig, RegistrationConfig};
use crate::domain::events::NetworkState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// `host:port` of the registration endpoint, or `None` if it has no host.
#[must_use]
pub fn probe_target(endpoint: &str) -> Option<String> {
    let url = reqwest::Url::parse(endpoint).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Derives connectivity from whether the registration host accepts TCP
/// connections, for hosts with no platform reachability callback.
#[derive(Debug)]
pub struct ReachabilityProbeWorker {
    reachability: Arc<WatchReachability>,
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityProbeWorker {
    /// Returns `None` when the endpoint has no probeable host.
    #[must_use]
    pub fn new(
        reachability: Arc<WatchReachability>,
        registration: &RegistrationConfig,
        config: &ReachabilityConfig,
    ) -> Option<Self> {
        let target = probe_target(&registration.endpoint)?;
        Some(Self {
            reachability,
            target,
            interval: Duration::from_secs(config.probe_interval_secs),
            timeout: Duration::from_millis(config.probe_timeout_ms),
        })
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    let state = self.probe().await;
                    self.reachability.set(state);
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Reachability probe loop shutting down...");
    }

    #[tracing::instrument(level = "debug", skip(self), fields(target = %self.target))]
    async fn probe(&self) -> NetworkState {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => NetworkState::online(),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Registration host unreachable");
                NetworkState::offline()
            }
            Err(_) => {
                tracing::debug!("Reachability probe timed out");
                NetworkState::offline()
            }
        }
    }
}
