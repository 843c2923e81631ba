use super::{PlatformError, PushPlatform};
use crate::domain::events::{PermissionStatus, RemoteMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

/// Push platform double driven from code: embedders that receive tokens from
/// elsewhere feed them in with [`InMemoryPushPlatform::rotate`].
#[derive(Debug)]
pub struct InMemoryPushPlatform {
    token: Mutex<Option<String>>,
    permission: Mutex<PermissionStatus>,
    failing: AtomicBool,
    token_requests: AtomicUsize,
    refresh_tx: broadcast::Sender<String>,
    message_tx: broadcast::Sender<RemoteMessage>,
}

impl InMemoryPushPlatform {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        let (refresh_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (message_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            token: Mutex::new(token),
            permission: Mutex::new(PermissionStatus::Authorized),
            failing: AtomicBool::new(false),
            token_requests: AtomicUsize::new(0),
            refresh_tx,
            message_tx,
        }
    }

    /// Changes the token without firing the refresh callback.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Changes the token and notifies refresh subscribers.
    pub fn rotate(&self, token: impl Into<String>) {
        let token = token.into();
        self.set_token(Some(token.clone()));
        // No subscribers is fine
        let _ = self.refresh_tx.send(token);
    }

    pub fn deliver_message(&self, message: RemoteMessage) {
        let _ = self.message_tx.send(message);
    }

    pub fn set_permission(&self, status: PermissionStatus) {
        *self.permission.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// When set, `get_token` returns a platform error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryPushPlatform {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl PushPlatform for InMemoryPushPlatform {
    async fn request_permission(&self) -> Result<PermissionStatus, PlatformError> {
        Ok(*self.permission.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn get_token(&self) -> Result<Option<String>, PlatformError> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Other(anyhow::anyhow!("simulated platform failure")));
        }
        Ok(self.token.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn subscribe_token_refresh(&self) -> broadcast::Receiver<String> {
        self.refresh_tx.subscribe()
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<RemoteMessage> {
        self.message_tx.subscribe()
    }
}
