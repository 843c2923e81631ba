use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Host application visibility, as reported by the platform's app-state callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Active,
    Background,
    Inactive,
}

impl TryFrom<&str> for AppState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "active" => Ok(Self::Active),
            "background" => Ok(Self::Background),
            "inactive" => Ok(Self::Inactive),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub reachable: bool,
}

impl NetworkState {
    #[must_use]
    pub const fn online() -> Self {
        Self { connected: true, reachable: true }
    }

    #[must_use]
    pub const fn offline() -> Self {
        Self { connected: false, reachable: false }
    }

    #[must_use]
    pub const fn is_online(self) -> bool {
        self.connected && self.reachable
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::online()
    }
}

/// Result of asking the user for notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Authorized,
    Provisional,
    Denied,
    NotDetermined,
}

impl PermissionStatus {
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Authorized | Self::Provisional)
    }
}

/// A push message delivered while the app is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub message_id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_from_platform_strings() {
        assert_eq!(AppState::try_from("active"), Ok(AppState::Active));
        assert_eq!(AppState::try_from("background"), Ok(AppState::Background));
        assert_eq!(AppState::try_from("unknown"), Err(()));
    }

    #[test]
    fn test_network_state_requires_both_flags() {
        assert!(NetworkState::online().is_online());
        assert!(!NetworkState { connected: true, reachable: false }.is_online());
        assert!(!NetworkState::offline().is_online());
    }

    #[test]
    fn test_provisional_permission_counts_as_granted() {
        assert!(PermissionStatus::Provisional.is_granted());
        assert!(!PermissionStatus::Denied.is_granted());
    }
}
