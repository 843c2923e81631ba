use crate::adapters::push::PushPlatform;
use crate::domain::events::{PermissionStatus, RemoteMessage};
use crate::domain::token::{TokenShape, redact};
use crate::error::{LifecycleError, NoTokenReason, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Front door to the push platform: permission, token acquisition and rotation.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    platform: Arc<dyn PushPlatform>,
    shape: TokenShape,
}

impl TokenProvider {
    #[must_use]
    pub fn new(platform: Arc<dyn PushPlatform>, shape: TokenShape) -> Self {
        Self { platform, shape }
    }

    /// # Errors
    /// Returns `NoTokenAvailable(PermissionDenied)` if the user refused
    /// notifications, or `NoTokenAvailable(Platform)` if the platform failed.
    pub async fn request_permission(&self) -> Result<PermissionStatus> {
        let status = self
            .platform
            .request_permission()
            .await
            .map_err(|e| LifecycleError::NoTokenAvailable(NoTokenReason::Platform(e.to_string())))?;

        if !status.is_granted() {
            tracing::warn!(?status, "Notification permission not granted");
            return Err(LifecycleError::NoTokenAvailable(NoTokenReason::PermissionDenied));
        }
        Ok(status)
    }

    /// Asks the platform for the current token and validates its shape.
    ///
    /// # Errors
    /// Returns `NoTokenAvailable` when the platform has no token, fails, or
    /// hands out a malformed one.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn acquire(&self) -> Result<String> {
        let token = self
            .platform
            .get_token()
            .await
            .map_err(|e| LifecycleError::NoTokenAvailable(NoTokenReason::Platform(e.to_string())))?
            .ok_or(LifecycleError::NoTokenAvailable(NoTokenReason::Empty))?;

        self.check_shape(&token)?;
        Ok(token)
    }

    /// # Errors
    /// Returns `NoTokenAvailable(Malformed)` if `token` fails the shape rules.
    pub fn check_shape(&self, token: &str) -> Result<()> {
        self.shape.check(token).map_err(|violation| {
            tracing::warn!(token = %redact(token), %violation, "Ignoring malformed push token");
            LifecycleError::NoTokenAvailable(NoTokenReason::Malformed(violation))
        })
    }

    #[must_use]
    pub fn subscribe_to_rotation(&self) -> broadcast::Receiver<String> {
        self.platform.subscribe_token_refresh()
    }

    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RemoteMessage> {
        self.platform.subscribe_messages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::push::InMemoryPushPlatform;
    use crate::domain::token::ShapeViolation;

    fn valid_token() -> String {
        format!("abc:{}", "x".repeat(150))
    }

    fn provider(platform: &Arc<InMemoryPushPlatform>) -> TokenProvider {
        TokenProvider::new(platform.clone(), TokenShape::default())
    }

    #[tokio::test]
    async fn test_acquire_returns_valid_token() {
        let platform = Arc::new(InMemoryPushPlatform::new(Some(valid_token())));
        assert_eq!(provider(&platform).acquire().await.unwrap(), valid_token());
    }

    #[tokio::test]
    async fn test_acquire_reports_why_no_token_is_available() {
        let platform = Arc::new(InMemoryPushPlatform::default());
        let provider = provider(&platform);

        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, LifecycleError::NoTokenAvailable(NoTokenReason::Empty)));

        platform.set_token(Some("abc:short".into()));
        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::NoTokenAvailable(NoTokenReason::Malformed(ShapeViolation::TooShort { .. }))
        ));

        platform.set_failing(true);
        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, LifecycleError::NoTokenAvailable(NoTokenReason::Platform(_))));
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let platform = Arc::new(InMemoryPushPlatform::new(Some(valid_token())));
        platform.set_permission(PermissionStatus::Denied);

        let err = provider(&platform).request_permission().await.unwrap_err();
        assert!(matches!(err, LifecycleError::NoTokenAvailable(NoTokenReason::PermissionDenied)));
    }
}
