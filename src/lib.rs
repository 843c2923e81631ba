#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod telemetry;
pub mod workers;

use crate::adapters::http::{RegistrationTransport, ReqwestTransport};
use crate::adapters::kv::{FileKeyValueStore, KeyValueStore};
use crate::adapters::lifecycle::{LifecycleBus, LifecycleEvents};
use crate::adapters::network::{ReachabilitySource, WatchReachability};
use crate::adapters::push::{FileTokenSource, InMemoryPushPlatform, PushPlatform};
use crate::config::Config;
use crate::domain::events::AppState;
use crate::domain::registration::RegistrationContext;
use crate::services::{
    BackoffPolicy, ManagerSettings, RegistrationClient, RetryScheduler, TokenLifecycleManager, TokenProvider,
    TokenStore,
};
use crate::workers::{ReachabilityProbeWorker, RetrySweepWorker, TokenFileWatchWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Fully wired components. Nothing runs until [`Workers::spawn_all`].
#[derive(Debug)]
pub struct App {
    pub manager: Arc<TokenLifecycleManager>,
    pub scheduler: Arc<RetryScheduler>,
    pub store: TokenStore,
    pub workers: Workers,
}

#[derive(Debug)]
pub struct Workers {
    manager: Arc<TokenLifecycleManager>,
    retry_sweep: RetrySweepWorker,
    reachability_probe: Option<ReachabilityProbeWorker>,
    token_file_watch: Option<TokenFileWatchWorker>,
}

impl Workers {
    #[must_use]
    pub fn spawn_all(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            tokio::spawn(self.manager.run(shutdown_rx.clone())),
            tokio::spawn(self.retry_sweep.run(shutdown_rx.clone())),
        ];

        if let Some(worker) = self.reachability_probe {
            tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
        if let Some(worker) = self.token_file_watch {
            tasks.push(tokio::spawn(worker.run(shutdown_rx)));
        }

        tasks
    }
}

/// Wires the lifecycle manager from configuration plus whichever host
/// adapters the embedder supplies. Anything not supplied gets a default.
#[derive(Debug)]
pub struct AppBuilder {
    config: Config,
    kv: Option<Arc<dyn KeyValueStore>>,
    platform: Option<Arc<dyn PushPlatform>>,
    token_file: Option<Arc<FileTokenSource>>,
    transport: Option<Arc<dyn RegistrationTransport>>,
    reachability: Option<Arc<dyn ReachabilitySource>>,
    probe: Option<Arc<WatchReachability>>,
    lifecycle: Option<Arc<dyn LifecycleEvents>>,
}

impl AppBuilder {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            kv: None,
            platform: None,
            token_file: None,
            transport: None,
            reachability: None,
            probe: None,
            lifecycle: None,
        }
    }

    #[must_use]
    pub fn with_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Arc<dyn PushPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Uses a token file as the platform and watches it for rotations.
    #[must_use]
    pub fn with_token_file(mut self, source: Arc<FileTokenSource>) -> Self {
        self.platform = Some(Arc::clone(&source) as Arc<dyn PushPlatform>);
        self.token_file = Some(source);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RegistrationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_reachability(mut self, reachability: Arc<dyn ReachabilitySource>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    /// Feeds reachability from TCP probes of the registration host.
    #[must_use]
    pub fn with_probe(mut self, reachability: Arc<WatchReachability>) -> Self {
        self.reachability = Some(Arc::clone(&reachability) as Arc<dyn ReachabilitySource>);
        self.probe = Some(reachability);
        self
    }

    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleEvents>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// # Errors
    /// Returns an error if the default HTTP transport cannot be created.
    pub fn build(self) -> anyhow::Result<App> {
        let config = self.config;

        let kv = self.kv.unwrap_or_else(|| Arc::new(FileKeyValueStore::new(&config.store.path)));
        let transport: Arc<dyn RegistrationTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let platform = self.platform.unwrap_or_else(|| {
            tracing::warn!("No token source configured; waiting for tokens to be supplied");
            Arc::new(InMemoryPushPlatform::default())
        });
        let lifecycle = self.lifecycle.unwrap_or_else(|| Arc::new(LifecycleBus::default()));

        let store = TokenStore::new(kv, config.store.key.clone());
        let provider = TokenProvider::new(platform, config.provider.shape());
        let client = Arc::new(RegistrationClient::new(transport, &config.registration));
        let context = RegistrationContext { customer: config.device.customer(), device_info: config.device.device_info() };
        let scheduler = Arc::new(RetryScheduler::new(
            store.clone(),
            client,
            BackoffPolicy::from_config(&config.retry),
            context,
        ));

        let manager = Arc::new(TokenLifecycleManager::new(
            provider,
            store.clone(),
            Arc::clone(&scheduler),
            lifecycle,
            self.reachability,
            ManagerSettings::from_config(&config),
        ));

        let sweep_interval = Duration::from_secs(config.retry.sweep_interval_secs.max(1));
        let reachability_probe = self
            .probe
            .filter(|_| config.reachability.probe_interval_secs > 0)
            .and_then(|probe| ReachabilityProbeWorker::new(probe, &config.registration, &config.reachability));
        let token_file_watch = self.token_file.map(|source| {
            TokenFileWatchWorker::new(source, Duration::from_secs(config.provider.poll_interval_secs.max(1)))
        });

        let workers = Workers {
            manager: Arc::clone(&manager),
            retry_sweep: RetrySweepWorker::new(Arc::clone(&scheduler), store.clone(), sweep_interval),
            reachability_probe,
            token_file_watch,
        };

        Ok(App { manager, scheduler, store, workers })
    }
}

/// Ctrl-C or SIGTERM flips the shutdown channel. On unix, SIGUSR1 and SIGUSR2
/// stand in for the host's foreground and background callbacks.
pub fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>, lifecycle: LifecycleBus) {
    tokio::spawn(async move {
        wait_for_shutdown_signal(&lifecycle).await;
        tracing::info!("Shutdown signal received, stopping token lifecycle...");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(lifecycle: &LifecycleBus) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut terminate), Ok(mut foreground), Ok(mut background)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) else {
        tracing::error!("Failed to install signal handlers, falling back to Ctrl-C only");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = terminate.recv() => return,
            _ = foreground.recv() => { lifecycle.emit(AppState::Active); }
            _ = background.recv() => { lifecycle.emit(AppState::Background); }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(_lifecycle: &LifecycleBus) {
    let _ = tokio::signal::ctrl_c().await;
}

/// Routes panics through tracing before the default hook runs.
pub fn setup_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "Unhandled panic");
        default_hook(info);
    }));
}
