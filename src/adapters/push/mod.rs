use crate::domain::events::{PermissionStatus, RemoteMessage};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod file;
pub mod memory;

pub use file::FileTokenSource;
pub use memory::InMemoryPushPlatform;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Push messaging is not supported here: {0}")]
    Unsupported(String),
    #[error("Push platform error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The push-messaging SDK as seen by this crate.
#[async_trait]
pub trait PushPlatform: Send + Sync + std::fmt::Debug {
    async fn request_permission(&self) -> Result<PermissionStatus, PlatformError>;

    /// Returns the current token, or `None` when the platform cannot issue one.
    async fn get_token(&self) -> Result<Option<String>, PlatformError>;

    /// Every token value the platform rotates to is sent on this channel.
    fn subscribe_token_refresh(&self) -> broadcast::Receiver<String>;

    fn subscribe_messages(&self) -> broadcast::Receiver<RemoteMessage>;
}
