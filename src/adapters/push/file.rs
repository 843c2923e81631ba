use super::{PlatformError, PushPlatform};
use crate::domain::events::{PermissionStatus, RemoteMessage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, broadcast};

/// Reads the push token from a file that an external helper keeps up to date
/// (for instance a platform bridge writing the SDK's token to disk).
///
/// Rotation is detected by [`FileTokenSource::poll`], driven by
/// `TokenFileWatchWorker`.
#[derive(Debug)]
pub struct FileTokenSource {
    path: PathBuf,
    last_seen: Mutex<Option<String>>,
    refresh_tx: broadcast::Sender<String>,
    message_tx: broadcast::Sender<RemoteMessage>,
}

impl FileTokenSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (refresh_tx, _) = broadcast::channel(16);
        let (message_tx, _) = broadcast::channel(16);
        Self { path: path.into(), last_seen: Mutex::new(None), refresh_tx, message_tx }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_token(&self) -> Result<Option<String>, PlatformError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PlatformError::Other(e.into())),
        }
    }

    /// Re-reads the file and notifies subscribers if the token changed.
    /// Returns whether a rotation was published.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub async fn poll(&self) -> Result<bool, PlatformError> {
        let Some(current) = self.read_token().await? else {
            return Ok(false);
        };

        let mut last_seen = self.last_seen.lock().await;
        if last_seen.as_deref() == Some(current.as_str()) {
            return Ok(false);
        }

        *last_seen = Some(current.clone());
        let _ = self.refresh_tx.send(current);
        Ok(true)
    }
}

#[async_trait]
impl PushPlatform for FileTokenSource {
    async fn request_permission(&self) -> Result<PermissionStatus, PlatformError> {
        Ok(PermissionStatus::Authorized)
    }

    async fn get_token(&self) -> Result<Option<String>, PlatformError> {
        let token = self.read_token().await?;
        if token.is_some() {
            // Whatever the caller saw is not a rotation for the watcher
            self.last_seen.lock().await.clone_from(&token);
        }
        Ok(token)
    }

    fn subscribe_token_refresh(&self) -> broadcast::Receiver<String> {
        self.refresh_tx.subscribe()
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<RemoteMessage> {
        self.message_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> PathBuf {
        std::env::temp_dir().join(format!("push-token-src-{}.txt", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_missing_file_yields_no_token() {
        let source = FileTokenSource::new(temp_file());
        assert_eq!(source.get_token().await.unwrap(), None);
        assert!(!source.poll().await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_publishes_only_changes() {
        let path = temp_file();
        tokio::fs::write(&path, "abc:first\n").await.unwrap();

        let source = FileTokenSource::new(&path);
        let mut rx = source.subscribe_token_refresh();

        assert_eq!(source.get_token().await.unwrap().as_deref(), Some("abc:first"));
        // Already seen through get_token
        assert!(!source.poll().await.unwrap());

        tokio::fs::write(&path, "abc:second").await.unwrap();
        assert!(source.poll().await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "abc:second");

        assert!(!source.poll().await.unwrap());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
