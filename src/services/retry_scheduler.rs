use crate::domain::registration::{AttemptSource, RegistrationContext, RegistrationOutcome};
use crate::domain::token::{CustomerRef, TokenRecord, redact};
use crate::services::backoff::{BackoffPolicy, NextStep};
use crate::services::registration::RegistrationClient;
use crate::services::token_store::TokenStore;
use crate::telemetry::METER_NAME;
use opentelemetry::{KeyValue, global, metrics::Counter};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Clone, Debug)]
struct Metrics {
    retries_scheduled: Counter<u64>,
    cooldowns: Counter<u64>,
    dropped_triggers: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(METER_NAME);
        Self {
            retries_scheduled: meter
                .u64_counter("registration_retries_scheduled_total")
                .with_description("Backoff timers armed after a failed registration")
                .build(),
            cooldowns: meter
                .u64_counter("registration_cooldowns_total")
                .with_description("Times the retry budget was exhausted")
                .build(),
            dropped_triggers: meter
                .u64_counter("registration_triggers_dropped_total")
                .with_description("Attempt triggers ignored because one was already in flight")
                .build(),
        }
    }
}

/// Where the pending registration currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Scheduled { delay: Duration },
    Attempting,
    AwaitingNetwork,
    CoolingDown { duration: Duration },
    Succeeded,
}

impl RetryState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled { .. } => "scheduled",
            Self::Attempting => "attempting",
            Self::AwaitingNetwork => "awaiting_network",
            Self::CoolingDown { .. } => "cooling_down",
            Self::Succeeded => "succeeded",
        }
    }
}

/// What a call to [`RetryScheduler::attempt`] ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Registered,
    /// The server call failed; a retry or cool-down has been armed.
    Failed(RegistrationOutcome),
    AlreadyRegistered,
    NothingPending,
    /// Another attempt holds the gate; this trigger was dropped.
    InFlight,
    CoolingDown,
    AwaitingNetwork,
    /// The token changed while the request was out; its result was discarded.
    Superseded,
}

impl AttemptResult {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Failed(_) => "failed",
            Self::AlreadyRegistered => "already_registered",
            Self::NothingPending => "nothing_pending",
            Self::InFlight => "in_flight",
            Self::CoolingDown => "cooling_down",
            Self::AwaitingNetwork => "awaiting_network",
            Self::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Backoff,
    CoolDown,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Pending {
    value: String,
    state: RetryState,
    timer: Option<ArmedTimer>,
}

impl Pending {
    fn new(value: &str) -> Self {
        Self { value: value.to_string(), state: RetryState::Idle, timer: None }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
    }
}

#[derive(Debug)]
struct Inner {
    pending: Option<Pending>,
    online: bool,
    next_generation: u64,
}

impl Inner {
    /// The entry for `value`, replacing (and disarming) one for any other token.
    fn track(&mut self, value: &str) -> &mut Pending {
        if let Some(mut old) = self.pending.take_if(|p| p.value != value) {
            old.disarm();
        }
        self.pending.get_or_insert_with(|| Pending::new(value))
    }

    fn pending_for(&mut self, value: &str) -> Option<&mut Pending> {
        self.pending.as_mut().filter(|p| p.value == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub token: Option<String>,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    pub timer_armed: bool,
    pub online: bool,
}

/// Drives a pending token to the `registered` state.
///
/// At most one registration request is outstanding at any time: triggers that
/// arrive while one is in flight are dropped rather than queued. Timers belong
/// to a single token value and are cancelled as soon as that value is
/// superseded, so a retry never fires for a token that is no longer current.
#[derive(Debug)]
pub struct RetryScheduler {
    store: TokenStore,
    client: Arc<RegistrationClient>,
    policy: BackoffPolicy,
    context: RwLock<RegistrationContext>,
    inner: Mutex<Inner>,
    gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    metrics: Metrics,
}

impl RetryScheduler {
    #[must_use]
    pub fn new(
        store: TokenStore,
        client: Arc<RegistrationClient>,
        policy: BackoffPolicy,
        context: RegistrationContext,
    ) -> Self {
        Self {
            store,
            client,
            policy,
            context: RwLock::new(context),
            inner: Mutex::new(Inner { pending: None, online: true, next_generation: 0 }),
            gate: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            metrics: Metrics::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    #[must_use]
    pub fn context(&self) -> RegistrationContext {
        self.context.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_customer(&self, customer: Option<CustomerRef>) {
        self.context.write().unwrap_or_else(PoisonError::into_inner).customer = customer;
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        std::mem::replace(&mut self.lock().online, online)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Stops tracking any older token and starts tracking `value`. Pending
    /// timers for the old value are cancelled.
    pub fn supersede(&self, value: &str) {
        let mut inner = self.lock();
        if let Some(old) = inner.pending.as_ref().filter(|p| p.value != value) {
            tracing::debug!(old = %redact(&old.value), new = %redact(value), "Superseding pending registration");
        }
        inner.track(value);
    }

    /// Adopts a record loaded at startup. Returns `true` when an attempt is due
    /// now; an exhausted record gets the rest of its cool-down instead.
    pub fn resume(self: &Arc<Self>, record: &TokenRecord) -> bool {
        {
            let mut inner = self.lock();
            let pending = inner.track(&record.value);
            if record.registered {
                pending.state = RetryState::Succeeded;
                return false;
            }
        }

        if self.policy.is_exhausted(record.retry_count) {
            let remaining = self.policy.remaining_cooldown(record.last_attempt_at, OffsetDateTime::now_utc());
            self.arm(&record.value, remaining, TimerKind::CoolDown);
            return false;
        }
        true
    }

    /// Drops the pending entry and cancels its timer.
    pub fn cancel_all(&self) {
        if let Some(mut pending) = self.lock().pending.take() {
            pending.disarm();
        }
    }

    /// Cancels every timer for good. Later calls to [`RetryScheduler::attempt`] do nothing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_all();
    }

    #[must_use]
    pub fn state(&self) -> Option<RetryState> {
        self.lock().pending.as_ref().map(|p| p.state)
    }

    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.lock();
        let pending = inner.pending.as_ref();
        let delay = pending.and_then(|p| match p.state {
            RetryState::Scheduled { delay } => Some(delay),
            RetryState::CoolingDown { duration } => Some(duration),
            _ => None,
        });
        SchedulerSnapshot {
            token: pending.map(|p| redact(&p.value)),
            state: pending.map_or(RetryState::Idle.as_str(), |p| p.state.as_str()),
            delay_secs: delay.map(|d| d.as_secs()),
            timer_armed: pending.is_some_and(|p| p.timer.is_some()),
            online: inner.online,
        }
    }

    /// Attempts to register whatever token the store currently holds.
    #[tracing::instrument(skip_all, fields(source = source.as_str()))]
    pub async fn attempt(self: &Arc<Self>, source: AttemptSource) -> AttemptResult {
        if self.shutdown.is_cancelled() {
            return AttemptResult::NothingPending;
        }

        let Ok(_gate) = self.gate.try_lock() else {
            tracing::debug!("Registration already in flight, dropping trigger");
            self.metrics.dropped_triggers.add(1, &[KeyValue::new("source", source.as_str())]);
            return AttemptResult::InFlight;
        };

        let mut source = source;
        loop {
            let record = match self.store.read().await {
                Ok(Some(record)) => record,
                Ok(None) => return AttemptResult::NothingPending,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot read token record");
                    return AttemptResult::NothingPending;
                }
            };

            if let Some(result) = self.admit(&record, source) {
                return result;
            }

            let context = self.context();
            let outcome = self.client.register(&record, &context, source).await;
            let result = self.settle(&record, outcome).await;

            // Triggers for a token that arrived mid-flight were dropped above
            match self.store.read().await {
                Ok(Some(current)) if current.value != record.value && !current.registered => {
                    tracing::debug!(token = %current.redacted(), "Token rotated during attempt, registering new value");
                    source = AttemptSource::Rotation;
                }
                _ => return result,
            }
        }
    }

    /// Attempts only if nothing is armed or in flight. Never shortens a cool-down.
    pub async fn sweep(self: &Arc<Self>) -> Option<AttemptResult> {
        let armed = self.lock().pending.as_ref().is_some_and(|p| p.timer.is_some());
        if armed {
            return None;
        }
        match self.attempt(AttemptSource::Sweep).await {
            AttemptResult::InFlight | AttemptResult::AlreadyRegistered | AttemptResult::NothingPending => None,
            result => Some(result),
        }
    }

    /// Decides whether `record` may go to the network now. `Some` means no.
    fn admit(self: &Arc<Self>, record: &TokenRecord, source: AttemptSource) -> Option<AttemptResult> {
        if record.registered {
            let mut inner = self.lock();
            let pending = inner.track(&record.value);
            pending.disarm();
            pending.state = RetryState::Succeeded;
            return Some(AttemptResult::AlreadyRegistered);
        }

        if self.policy.is_exhausted(record.retry_count) {
            let cooling = {
                let mut inner = self.lock();
                let pending = inner.track(&record.value);
                matches!(pending.state, RetryState::CoolingDown { .. }) && pending.timer.is_some()
            };
            if !cooling {
                let remaining = self.policy.remaining_cooldown(record.last_attempt_at, OffsetDateTime::now_utc());
                self.arm(&record.value, remaining, TimerKind::CoolDown);
            }
            tracing::debug!("Cooling down, ignoring trigger");
            return Some(AttemptResult::CoolingDown);
        }

        let mut inner = self.lock();
        let online = inner.online;
        let pending = inner.track(&record.value);
        pending.disarm();

        if !online && matches!(source, AttemptSource::Retry | AttemptSource::Sweep) {
            pending.state = RetryState::AwaitingNetwork;
            tracing::info!(token = %record.redacted(), "Offline, waiting for connectivity before retrying");
            return Some(AttemptResult::AwaitingNetwork);
        }

        pending.state = RetryState::Attempting;
        None
    }

    async fn settle(self: &Arc<Self>, record: &TokenRecord, outcome: RegistrationOutcome) -> AttemptResult {
        let value = &record.value;

        if outcome.is_success() {
            return match self.store.mark_registered(value).await {
                Ok(true) => {
                    if let Some(pending) = self.lock().pending_for(value) {
                        pending.disarm();
                        pending.state = RetryState::Succeeded;
                    }
                    AttemptResult::Registered
                }
                Ok(false) => {
                    tracing::debug!(token = %record.redacted(), "Dropping acknowledgement for superseded token");
                    AttemptResult::Superseded
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to record successful registration");
                    AttemptResult::Registered
                }
            };
        }

        let retry_count = match self.store.increment_retry(value).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                tracing::debug!(token = %record.redacted(), "Dropping failure for superseded token");
                return AttemptResult::Superseded;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to record failed registration");
                record.retry_count.saturating_add(1)
            }
        };

        match self.policy.after_failure(retry_count) {
            NextStep::Retry(delay) => {
                self.metrics.retries_scheduled.add(1, &[]);
                self.arm(value, delay, TimerKind::Backoff);
            }
            NextStep::CoolDown(duration) => {
                self.metrics.cooldowns.add(1, &[]);
                self.arm(value, duration, TimerKind::CoolDown);
            }
        }
        AttemptResult::Failed(outcome)
    }

    fn arm(self: &Arc<Self>, value: &str, delay: Duration, kind: TimerKind) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let (generation, cancel) = {
            let mut inner = self.lock();
            let generation = inner.next_generation;
            inner.next_generation += 1;

            let Some(pending) = inner.pending_for(value) else {
                return;
            };
            pending.disarm();

            let cancel = self.shutdown.child_token();
            pending.timer = Some(ArmedTimer { generation, cancel: cancel.clone() });
            pending.state = match kind {
                TimerKind::Backoff => RetryState::Scheduled { delay },
                TimerKind::CoolDown => RetryState::CoolingDown { duration: delay },
            };
            (generation, cancel)
        };

        match kind {
            TimerKind::Backoff => {
                tracing::info!(token = %redact(value), delay_secs = delay.as_secs(), "Registration retry scheduled");
            }
            TimerKind::CoolDown => {
                tracing::warn!(
                    token = %redact(value),
                    cooldown_secs = delay.as_secs(),
                    "Retry budget exhausted, cooling down"
                );
            }
        }

        let scheduler = Arc::clone(self);
        let value = value.to_string();
        let span = tracing::debug_span!("retry_timer", ?kind);
        tokio::spawn(
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(delay) => scheduler.fire(&value, generation, kind).await,
                }
            }
            .instrument(span),
        );
    }

    async fn fire(self: &Arc<Self>, value: &str, generation: u64, kind: TimerKind) {
        {
            let mut inner = self.lock();
            let Some(pending) = inner
                .pending_for(value)
                .filter(|p| p.timer.as_ref().is_some_and(|t| t.generation == generation))
            else {
                return;
            };
            pending.timer = None;
            pending.state = RetryState::Idle;
        }

        if kind == TimerKind::CoolDown {
            match self.store.reset_retry(value).await {
                Ok(true) => tracing::info!(token = %redact(value), "Cool-down over, retry counter reset"),
                Ok(false) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reset retry counter after cool-down");
                    return;
                }
            }
        }

        let result = self.attempt(AttemptSource::Retry).await;
        tracing::debug!(?result, "Timer-driven attempt finished");
    }
}
