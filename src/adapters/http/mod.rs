use crate::domain::registration::{NetworkFailureReason, RegistrationPayload};
use async_trait::async_trait;
use std::time::Duration;

pub mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

#[derive(Debug, Clone, Copy)]
pub struct TransportRequest<'a> {
    pub url: &'a str,
    pub bearer_token: &'a str,
    pub payload: &'a RegistrationPayload,
    pub timeout: Duration,
}

/// Whatever the server answered, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Sends a registration payload as a JSON POST.
///
/// Implementations return `Ok` for any completed HTTP exchange, whatever the
/// status, and `Err` only when no response was obtained.
#[async_trait]
pub trait RegistrationTransport: Send + Sync + std::fmt::Debug {
    async fn post_json(&self, request: TransportRequest<'_>) -> Result<TransportResponse, NetworkFailureReason>;
}
