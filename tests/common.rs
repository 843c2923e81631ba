#![allow(dead_code)]

use async_trait::async_trait;
use push_token_lifecycle::adapters::http::{RegistrationTransport, TransportRequest, TransportResponse};
use push_token_lifecycle::adapters::kv::{InMemoryKeyValueStore, KeyValueStore};
use push_token_lifecycle::adapters::lifecycle::LifecycleBus;
use push_token_lifecycle::adapters::network::{ReachabilitySource, WatchReachability};
use push_token_lifecycle::adapters::push::InMemoryPushPlatform;
use push_token_lifecycle::config::Config;
use push_token_lifecycle::domain::registration::NetworkFailureReason;
use push_token_lifecycle::domain::token::TokenRecord;
use push_token_lifecycle::{App, AppBuilder};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const STORE_KEY: &str = "@test/record";

pub fn setup_tracing() {
    push_token_lifecycle::telemetry::init_test_telemetry();
}

/// A token that passes the default shape rules. `tag` must be alphanumeric.
pub fn test_token(tag: &str) -> String {
    format!("{tag}:{}", "x".repeat(150))
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.key = STORE_KEY.to_string();
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Status(u16),
    Network,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub token: String,
    pub source: String,
    pub body: serde_json::Value,
    /// Persisted record at the moment the request left.
    pub persisted: Option<TokenRecord>,
}

/// Registration transport that answers from a script, then from a default.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
    failing_tokens: Mutex<HashSet<String>>,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    kv: Mutex<Option<Arc<dyn KeyValueStore>>>,
}

impl ScriptedTransport {
    pub fn new(default: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            failing_tokens: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            kv: Mutex::new(None),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Reply::Ok)
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.script.lock().unwrap().extend(replies);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests for `token` always fail with a network error.
    pub fn fail_token(&self, token: &str) {
        self.failing_tokens.lock().unwrap().insert(token.to_string());
    }

    fn observe_store(&self, kv: Arc<dyn KeyValueStore>) {
        *self.kv.lock().unwrap() = Some(kv);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.token).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistrationTransport for ScriptedTransport {
    async fn post_json(&self, request: TransportRequest<'_>) -> Result<TransportResponse, NetworkFailureReason> {
        let kv = self.kv.lock().unwrap().clone();
        let persisted = match kv {
            Some(kv) => kv.get(STORE_KEY).await.ok().flatten().and_then(|raw| serde_json::from_str(&raw).ok()),
            None => None,
        };

        let body = serde_json::to_value(request.payload).unwrap();
        self.calls.lock().unwrap().push(Call {
            at: Instant::now(),
            token: request.payload.token.clone(),
            source: body["source"].as_str().unwrap_or_default().to_string(),
            body,
            persisted,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = if self.failing_tokens.lock().unwrap().contains(&request.payload.token) {
            Reply::Network
        } else {
            self.script.lock().unwrap().pop_front().unwrap_or(self.default)
        };

        match reply {
            Reply::Ok => Ok(TransportResponse { status: 200, body: r#"{"status":"ok"}"#.into() }),
            Reply::Status(status) => Ok(TransportResponse { status, body: "rejected".into() }),
            Reply::Network => Err(NetworkFailureReason::Connect("connection refused".into())),
        }
    }
}

pub struct Harness {
    pub kv: Arc<InMemoryKeyValueStore>,
    pub platform: Arc<InMemoryPushPlatform>,
    pub transport: Arc<ScriptedTransport>,
    pub reachability: Arc<WatchReachability>,
    pub lifecycle: LifecycleBus,
    pub app: App,
}

impl Harness {
    pub fn new(config: Config, transport: ScriptedTransport, token: Option<String>) -> Self {
        Self::with_kv(config, transport, token, Arc::new(InMemoryKeyValueStore::new()))
    }

    /// Builds on an existing store, as if the process had restarted.
    pub fn with_kv(
        config: Config,
        transport: ScriptedTransport,
        token: Option<String>,
        kv: Arc<InMemoryKeyValueStore>,
    ) -> Self {
        setup_tracing();

        let transport = Arc::new(transport);
        transport.observe_store(kv.clone());
        let platform = Arc::new(InMemoryPushPlatform::new(token));
        let reachability = Arc::new(WatchReachability::default());
        let lifecycle = LifecycleBus::default();

        let app = AppBuilder::new(config)
            .with_store(kv.clone())
            .with_platform(platform.clone())
            .with_transport(transport.clone())
            .with_reachability(reachability.clone() as Arc<dyn ReachabilitySource>)
            .with_lifecycle(Arc::new(lifecycle.clone()))
            .build()
            .expect("Failed to build app");

        Self { kv, platform, transport, reachability, lifecycle, app }
    }

    pub async fn record(&self) -> Option<TokenRecord> {
        self.app.store.read().await.unwrap()
    }

    /// What a fresh process would load.
    pub async fn persisted(&self) -> Option<TokenRecord> {
        let raw = self.kv.get(STORE_KEY).await.unwrap()?;
        Some(serde_json::from_str(&raw).unwrap())
    }
}
