use super::{RegistrationTransport, TransportRequest, TransportResponse};
use crate::domain::registration::NetworkFailureReason;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with its own connection pool.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(err: &reqwest::Error) -> NetworkFailureReason {
    if err.is_timeout() {
        NetworkFailureReason::Timeout
    } else if err.is_connect() {
        NetworkFailureReason::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
        NetworkFailureReason::Aborted
    } else {
        NetworkFailureReason::Other(err.to_string())
    }
}

#[async_trait]
impl RegistrationTransport for ReqwestTransport {
    async fn post_json(&self, request: TransportRequest<'_>) -> Result<TransportResponse, NetworkFailureReason> {
        let response = self
            .client
            .post(request.url)
            .bearer_auth(request.bearer_token)
            .json(request.payload)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| classify(&e))?;

        Ok(TransportResponse { status, body })
    }
}
