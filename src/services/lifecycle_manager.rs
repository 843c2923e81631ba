use crate::adapters::lifecycle::LifecycleEvents;
use crate::adapters::network::ReachabilitySource;
use crate::config::Config;
use crate::domain::events::{AppState, NetworkState, RemoteMessage};
use crate::domain::registration::AttemptSource;
use crate::domain::token::{CustomerRef, Platform, TokenRecord, redact};
use crate::error::{LifecycleError, NoTokenReason, Result};
use crate::services::retry_scheduler::{AttemptResult, RetryScheduler, SchedulerSnapshot};
use crate::services::token_provider::TokenProvider;
use crate::services::token_store::TokenStore;
use crate::telemetry::METER_NAME;
use opentelemetry::{KeyValue, global, metrics::Counter};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

#[derive(Clone, Debug)]
struct Metrics {
    rotations: Counter<u64>,
    acquisition_failures: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(METER_NAME);
        Self {
            rotations: meter
                .u64_counter("token_rotations_total")
                .with_description("New token values observed, by trigger")
                .build(),
            acquisition_failures: meter
                .u64_counter("token_acquisition_failures_total")
                .with_description("Times the platform could not hand out a usable token")
                .build(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub platform: Platform,
    pub token_ttl: Duration,
    pub background_grace: Duration,
    pub request_permission: bool,
}

impl ManagerSettings {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            platform: config.device.platform,
            token_ttl: config.store.token_ttl(),
            background_grace: Duration::from_secs(config.retry.background_grace_secs),
            request_permission: config.provider.request_permission,
        }
    }
}

/// Point-in-time view of the token lifecycle, for support tooling.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub platform: Platform,
    pub record: Option<TokenRecord>,
    pub provider_token: Option<String>,
    /// Whether the stored token is the one the platform currently hands out.
    pub in_sync: bool,
    pub scheduler: SchedulerSnapshot,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

/// Owns the token lifecycle: reacts to startup, rotation, lifecycle and
/// connectivity events and keeps the current token registered.
#[derive(Debug)]
pub struct TokenLifecycleManager {
    provider: TokenProvider,
    store: TokenStore,
    scheduler: Arc<RetryScheduler>,
    lifecycle: Arc<dyn LifecycleEvents>,
    reachability: Option<Arc<dyn ReachabilitySource>>,
    settings: ManagerSettings,
    metrics: Metrics,
}

impl TokenLifecycleManager {
    #[must_use]
    pub fn new(
        provider: TokenProvider,
        store: TokenStore,
        scheduler: Arc<RetryScheduler>,
        lifecycle: Arc<dyn LifecycleEvents>,
        reachability: Option<Arc<dyn ReachabilitySource>>,
        settings: ManagerSettings,
    ) -> Self {
        Self { provider, store, scheduler, lifecycle, reachability, settings, metrics: Metrics::new() }
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    async fn stored(&self) -> Option<TokenRecord> {
        match self.store.read().await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Token record unavailable");
                None
            }
        }
    }

    async fn acquire(&self) -> Result<String> {
        self.provider.acquire().await.inspect_err(|e| {
            if let LifecycleError::NoTokenAvailable(reason) = e {
                self.metrics.acquisition_failures.add(1, &[KeyValue::new("reason", reason.label())]);
            }
        })
    }

    /// Startup sequence: adopt any stored record, ask for permission, fetch the
    /// current token and reconcile it with what was stored.
    ///
    /// # Errors
    /// Returns `NoTokenAvailable` if no token could be obtained. A stored
    /// pending token is still attempted in that case.
    #[tracing::instrument(skip(self))]
    pub async fn cold_start(&self) -> Result<TokenRecord> {
        let stored = self.stored().await;
        let due = stored.as_ref().is_some_and(|record| self.scheduler.resume(record));

        let acquired = if self.settings.request_permission {
            match self.provider.request_permission().await {
                Ok(_) => self.acquire().await,
                Err(e) => Err(e),
            }
        } else {
            self.acquire().await
        };

        let value = match acquired {
            Ok(value) => value,
            Err(e) => {
                if due {
                    self.scheduler.attempt(AttemptSource::ColdStart).await;
                }
                return Err(e);
            }
        };

        match stored {
            Some(record) if self.is_current(&record, &value) => {
                if due {
                    self.scheduler.attempt(AttemptSource::ColdStart).await;
                }
                Ok(self.stored().await.unwrap_or(record))
            }
            _ => self.rotate_to(value, AttemptSource::ColdStart).await.map(|(record, _)| record),
        }
    }

    fn is_current(&self, record: &TokenRecord, value: &str) -> bool {
        record.value == value && !record.is_stale(self.settings.token_ttl, OffsetDateTime::now_utc())
    }

    /// Handles a token announced by the platform's refresh callback.
    ///
    /// Re-announcing the current token is a no-op.
    ///
    /// # Errors
    /// Returns `NoTokenAvailable(Malformed)` for a token that fails validation.
    #[tracing::instrument(skip_all, fields(token = %redact(&value)))]
    pub async fn handle_rotation(&self, value: String) -> Result<TokenRecord> {
        match self.stored().await {
            Some(record) if self.is_current(&record, &value) => {
                tracing::debug!("Rotation callback repeated the current token");
                Ok(record)
            }
            _ => self.rotate_to(value, AttemptSource::Rotation).await.map(|(record, _)| record),
        }
    }

    /// Persists `value` as the new current token, then registers it right away.
    async fn rotate_to(&self, value: String, source: AttemptSource) -> Result<(TokenRecord, AttemptResult)> {
        self.provider.check_shape(&value)?;

        let customer = self.scheduler.context().customer;
        let record = TokenRecord::new(value, self.settings.platform, customer);

        self.scheduler.supersede(&record.value);
        if let Err(e) = self.store.write(&record).await {
            tracing::warn!(error = %e, "New token kept in memory only until the next successful write");
        }
        self.metrics.rotations.add(1, &[KeyValue::new("source", source.as_str())]);
        tracing::info!(token = %record.redacted(), source = source.as_str(), "Adopted new push token");

        let result = self.scheduler.attempt(source).await;
        tracing::debug!(?result, "Initial registration attempt finished");

        let record = self.stored().await.filter(|r| r.value == record.value).unwrap_or(record);
        Ok((record, result))
    }

    /// App came to the foreground: pick up a rotation the callback may have
    /// missed, otherwise retry any still-unregistered token.
    #[tracing::instrument(skip(self))]
    pub async fn on_foreground(&self) -> Option<AttemptResult> {
        match self.acquire().await {
            Ok(value) => match self.stored().await {
                Some(record) if self.is_current(&record, &value) => {
                    if record.registered {
                        None
                    } else {
                        Some(self.scheduler.attempt(AttemptSource::Foreground).await)
                    }
                }
                _ => {
                    tracing::info!("Token changed while in background");
                    match self.rotate_to(value, AttemptSource::Foreground).await {
                        Ok((_, result)) => Some(result),
                        Err(e) => {
                            tracing::warn!(error = %e, "Could not adopt token seen on foreground");
                            None
                        }
                    }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "No token on foreground");
                Some(self.scheduler.attempt(AttemptSource::Foreground).await)
            }
        }
    }

    /// App went to the background: make one last attempt without holding the
    /// caller up. The handle resolves once the attempt finishes or the grace
    /// period runs out; in the latter case the attempt keeps running and settles
    /// the scheduler state when the server answers.
    pub fn on_background(self: &Arc<Self>) -> JoinHandle<Option<AttemptResult>> {
        let scheduler = Arc::clone(&self.scheduler);
        let grace = self.settings.background_grace;
        tokio::spawn(
            async move {
                let attempt =
                    tokio::spawn(async move { scheduler.attempt(AttemptSource::Background).await }.in_current_span());
                match tokio::time::timeout(grace, attempt).await {
                    Ok(Ok(result)) => Some(result),
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Background registration task failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            grace_secs = grace.as_secs(),
                            "Background registration still running after grace period"
                        );
                        None
                    }
                }
            }
            .instrument(tracing::info_span!("on_background")),
        )
    }

    /// Connectivity changed. Coming back online triggers an attempt.
    pub async fn on_network_change(&self, state: NetworkState) -> Option<AttemptResult> {
        let online = state.is_online();
        let was_online = self.scheduler.set_online(online);
        if online == was_online {
            return None;
        }

        if online {
            tracing::info!("Network restored");
            Some(self.scheduler.attempt(AttemptSource::Reachability).await)
        } else {
            tracing::info!(connected = state.connected, reachable = state.reachable, "Network lost");
            None
        }
    }

    /// Changes the customer the token is registered for. A different customer
    /// means the token has to be registered again.
    ///
    /// # Errors
    /// Returns `Persistence` if the record cannot be loaded.
    #[tracing::instrument(skip_all, fields(customer_id = customer.as_ref().map(|c| c.customer_id.as_str())))]
    pub async fn set_customer(&self, customer: Option<CustomerRef>) -> Result<Option<AttemptResult>> {
        self.scheduler.set_customer(customer.clone());
        if self.store.update_customer(customer).await? {
            return Ok(Some(self.scheduler.attempt(AttemptSource::CustomerUpdate).await));
        }
        Ok(None)
    }

    /// Registers the current token now and reports the server's verdict.
    ///
    /// # Errors
    /// Returns `NoTokenAvailable`, `Rejected` or `Network` for a failed
    /// attempt, and `NotRegistered` when the attempt was skipped, for example
    /// during a cool-down.
    pub async fn register_now(&self) -> Result<TokenRecord> {
        let value = self.acquire().await?;

        let result = match self.stored().await {
            Some(record) if self.is_current(&record, &value) => {
                if record.registered {
                    return Ok(record);
                }
                self.scheduler.supersede(&record.value);
                self.scheduler.attempt(AttemptSource::ColdStart).await
            }
            _ => self.rotate_to(value, AttemptSource::ColdStart).await?.1,
        };

        if let AttemptResult::Failed(outcome) = &result {
            outcome.clone().into_result()?;
        }
        let record = self.stored().await.ok_or(LifecycleError::NoTokenAvailable(NoTokenReason::Empty))?;
        if !record.registered {
            return Err(LifecycleError::NotRegistered(result.as_str()));
        }
        Ok(record)
    }

    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        let record = self.stored().await;
        let provider_token = self.provider.acquire().await.ok();
        let in_sync = match (&record, &provider_token) {
            (Some(record), Some(token)) => record.value == *token,
            _ => false,
        };

        DiagnosticsSnapshot {
            platform: self.settings.platform,
            record,
            provider_token: provider_token.as_deref().map(redact),
            in_sync,
            scheduler: self.scheduler.snapshot(),
            generated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Forgets the stored token and anything scheduled for it.
    ///
    /// # Errors
    /// Returns `Persistence` if the record cannot be removed.
    pub async fn reset(&self) -> Result<()> {
        self.scheduler.cancel_all();
        self.store.clear().await?;
        tracing::info!("Token record cleared");
        Ok(())
    }

    fn log_message(message: &RemoteMessage) {
        tracing::info!(
            message_id = message.message_id.as_deref(),
            title = message.title.as_deref(),
            data_keys = ?message.data.keys().collect::<Vec<_>>(),
            "Push message received in foreground"
        );
    }

    /// Runs the manager until `shutdown` flips. Every event source is
    /// subscribed before the cold start so nothing emitted during it is lost.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut lifecycle_rx = Some(self.lifecycle.subscribe());
        let mut rotation_rx = Some(self.provider.subscribe_to_rotation());
        let mut message_rx = Some(self.provider.subscribe_messages());
        let mut network_rx = self.reachability.as_ref().map(|r| r.subscribe());

        if let Some(rx) = network_rx.as_mut() {
            let state = *rx.borrow_and_update();
            self.scheduler.set_online(state.is_online());
        }

        match self.cold_start().await {
            Ok(record) => tracing::info!(token = %record.redacted(), registered = record.registered, "Cold start complete"),
            Err(e) => tracing::warn!(error = %e, "Cold start found no usable token"),
        }

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = recv(&mut lifecycle_rx) => match event {
                    AppState::Active => { self.on_foreground().await; }
                    AppState::Background => { self.on_background(); }
                    AppState::Inactive => {}
                },
                value = recv_latest(&mut rotation_rx) => match value {
                    Some(value) => {
                        if let Err(e) = self.handle_rotation(value).await {
                            tracing::warn!(error = %e, "Rotated token rejected");
                        }
                    }
                    // Missed rotations: ask the platform directly
                    None => { self.on_foreground().await; }
                },
                message = recv(&mut message_rx) => Self::log_message(&message),
                state = changed(&mut network_rx) => { self.on_network_change(state).await; }
            }
        }

        self.scheduler.shutdown();
        tracing::info!("Token lifecycle manager stopped");
    }
}

/// Next event from an optional subscription. A closed channel is dropped and
/// never yields again.
async fn recv<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> T {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(value) => return value,
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event subscriber lagged"),
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

/// Like [`recv`], but reports a lag as `None` instead of skipping it.
async fn recv_latest<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(value) => return Some(value),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Rotation events lagged");
                return None;
            }
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

async fn changed(rx: &mut Option<watch::Receiver<NetworkState>>) -> NetworkState {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        if inner.changed().await.is_ok() {
            return *inner.borrow_and_update();
        }
        *rx = None;
    }
}
