use crate::adapters::http::{RegistrationTransport, TransportRequest};
use crate::config::RegistrationConfig;
use crate::domain::registration::{
    AttemptSource, NetworkFailureReason, RegistrationContext, RegistrationOutcome, RegistrationPayload,
};
use crate::domain::token::TokenRecord;
use crate::telemetry::METER_NAME;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

const LOGGED_BODY_LIMIT: usize = 256;

#[derive(Clone, Debug)]
struct Metrics {
    attempts: Counter<u64>,
    duration: Histogram<f64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(METER_NAME);
        Self {
            attempts: meter
                .u64_counter("registration_attempts_total")
                .with_description("Registration calls by outcome")
                .build(),
            duration: meter
                .f64_histogram("registration_duration_seconds")
                .with_description("Time spent in a single registration call")
                .build(),
        }
    }
}

/// Sends token registrations to the backend and classifies what came back.
///
/// The client never retries; that is the scheduler's job.
#[derive(Debug)]
pub struct RegistrationClient {
    transport: Arc<dyn RegistrationTransport>,
    endpoint: String,
    bearer_token: String,
    timeout: Duration,
    metrics: Metrics,
}

impl RegistrationClient {
    #[must_use]
    pub fn new(transport: Arc<dyn RegistrationTransport>, config: &RegistrationConfig) -> Self {
        Self {
            transport,
            endpoint: config.endpoint.clone(),
            bearer_token: config.bearer_token.clone(),
            timeout: config.timeout(),
            metrics: Metrics::new(),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(token = %record.redacted(), source = source.as_str(), outcome = tracing::field::Empty)
    )]
    pub async fn register(
        &self,
        record: &TokenRecord,
        context: &RegistrationContext,
        source: AttemptSource,
    ) -> RegistrationOutcome {
        let payload = RegistrationPayload::build(record, context, source, OffsetDateTime::now_utc());
        let request = TransportRequest {
            url: &self.endpoint,
            bearer_token: &self.bearer_token,
            payload: &payload,
            timeout: self.timeout,
        };

        let start = Instant::now();
        // The transport applies the timeout too; this bounds transports that don't
        let outcome = match tokio::time::timeout(self.timeout, self.transport.post_json(request)).await {
            Err(_) => RegistrationOutcome::NetworkFailure(NetworkFailureReason::Timeout),
            Ok(Err(reason)) => RegistrationOutcome::NetworkFailure(reason),
            Ok(Ok(response)) if response.is_success() => {
                let body = serde_json::from_str(&response.body).unwrap_or(serde_json::Value::Null);
                RegistrationOutcome::Success(body)
            }
            Ok(Ok(response)) => RegistrationOutcome::Rejected { status: response.status, body: response.body },
        };

        let label = outcome.label();
        tracing::Span::current().record("outcome", label);
        self.metrics.attempts.add(1, &[KeyValue::new("outcome", label)]);
        self.metrics.duration.record(start.elapsed().as_secs_f64(), &[KeyValue::new("outcome", label)]);

        match &outcome {
            RegistrationOutcome::Success(_) => tracing::info!("Push token registered"),
            RegistrationOutcome::Rejected { status, body } => {
                let body: String = body.chars().take(LOGGED_BODY_LIMIT).collect();
                tracing::warn!(status, %body, "Registration rejected by server");
            }
            RegistrationOutcome::NetworkFailure(reason) => {
                tracing::warn!(%reason, "Registration request did not complete");
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http::TransportResponse;
    use crate::domain::token::Platform;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FixedTransport {
        reply: Result<TransportResponse, NetworkFailureReason>,
        delay: Duration,
        seen: Mutex<Vec<serde_json::Value>>,
    }

    impl FixedTransport {
        fn new(reply: Result<TransportResponse, NetworkFailureReason>) -> Self {
            Self { reply, delay: Duration::ZERO, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl RegistrationTransport for FixedTransport {
        async fn post_json(&self, request: TransportRequest<'_>) -> Result<TransportResponse, NetworkFailureReason> {
            self.seen.lock().unwrap().push(serde_json::to_value(request.payload).unwrap());
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn client(transport: Arc<FixedTransport>) -> RegistrationClient {
        RegistrationClient::new(transport, &RegistrationConfig::default())
    }

    fn record() -> TokenRecord {
        TokenRecord::new("abc:token", Platform::Ios, None)
    }

    fn response(status: u16, body: &str) -> Result<TransportResponse, NetworkFailureReason> {
        Ok(TransportResponse { status, body: body.to_string() })
    }

    #[tokio::test]
    async fn test_success_keeps_json_body() {
        let transport = Arc::new(FixedTransport::new(response(200, r#"{"id":"r-1"}"#)));
        let outcome = client(transport.clone())
            .register(&record(), &RegistrationContext::default(), AttemptSource::Rotation)
            .await;

        assert_eq!(outcome, RegistrationOutcome::Success(serde_json::json!({"id": "r-1"})));
        let sent = transport.seen.lock().unwrap();
        assert_eq!(sent[0]["token"], "abc:token");
        assert_eq!(sent[0]["source"], "rotation");
    }

    #[tokio::test]
    async fn test_success_with_non_json_body() {
        let transport = Arc::new(FixedTransport::new(response(204, "")));
        let outcome = client(transport).register(&record(), &RegistrationContext::default(), AttemptSource::Retry).await;
        assert_eq!(outcome, RegistrationOutcome::Success(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_non_2xx_is_rejected_not_network_failure() {
        let transport = Arc::new(FixedTransport::new(response(503, "maintenance")));
        let outcome = client(transport).register(&record(), &RegistrationContext::default(), AttemptSource::Retry).await;
        assert_eq!(outcome, RegistrationOutcome::Rejected { status: 503, body: "maintenance".into() });
        assert_eq!(outcome.label(), "rejected_server");
    }

    #[tokio::test]
    async fn test_transport_error_is_network_failure() {
        let transport = Arc::new(FixedTransport::new(Err(NetworkFailureReason::Connect("refused".into()))));
        let outcome = client(transport).register(&record(), &RegistrationContext::default(), AttemptSource::Retry).await;
        assert!(matches!(outcome, RegistrationOutcome::NetworkFailure(NetworkFailureReason::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        let mut transport = FixedTransport::new(response(200, "{}"));
        transport.delay = Duration::from_secs(120);
        let outcome = client(Arc::new(transport))
            .register(&record(), &RegistrationContext::default(), AttemptSource::Retry)
            .await;
        assert_eq!(outcome, RegistrationOutcome::NetworkFailure(NetworkFailureReason::Timeout));
    }
}
