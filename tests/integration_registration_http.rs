mod common;

use common::{setup_tracing, test_token};
use push_token_lifecycle::adapters::http::ReqwestTransport;
use push_token_lifecycle::config::RegistrationConfig;
use push_token_lifecycle::domain::registration::{
    AttemptSource, NetworkFailureReason, RegistrationContext, RegistrationOutcome,
};
use push_token_lifecycle::domain::token::{CustomerRef, Platform, TokenRecord};
use push_token_lifecycle::services::RegistrationClient;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(endpoint: String, timeout_secs: u64) -> RegistrationClient {
    let config = RegistrationConfig { endpoint, bearer_token: "secret-key".into(), timeout_secs };
    RegistrationClient::new(Arc::new(ReqwestTransport::new().unwrap()), &config)
}

fn record() -> TokenRecord {
    TokenRecord::new(test_token("device"), Platform::Android, Some(CustomerRef::new("cust-1", None)))
}

#[tokio::test]
async fn test_posts_json_with_bearer_auth() {
    setup_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/push/token"))
        .and(header("authorization", "Bearer secret-key"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "reg-9" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(format!("{}/api/push/token", server.uri()), 5);
    let outcome = client.register(&record(), &RegistrationContext::default(), AttemptSource::ColdStart).await;
    assert_eq!(outcome, RegistrationOutcome::Success(json!({ "id": "reg-9" })));

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["token"], test_token("device"));
    assert_eq!(body["platform"], "android");
    assert_eq!(body["source"], "cold_start");
    assert_eq!(body["customerId"], "cust-1");
    assert!(body["timestamp"].is_string());
    assert!(body.get("email").is_none());
    assert!(body.get("deviceInfo").is_none());
}

#[tokio::test]
async fn test_non_json_success_body_is_null() {
    setup_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200).set_body_string("OK")).mount(&server).await;

    let client = client_for(server.uri(), 5);
    let outcome = client.register(&record(), &RegistrationContext::default(), AttemptSource::Retry).await;
    assert_eq!(outcome, RegistrationOutcome::Success(serde_json::Value::Null));
}

#[tokio::test]
async fn test_unauthorized_is_rejected() {
    setup_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let client = client_for(server.uri(), 5);
    let outcome = client.register(&record(), &RegistrationContext::default(), AttemptSource::Foreground).await;
    assert_eq!(outcome, RegistrationOutcome::Rejected { status: 401, body: "bad credentials".into() });
    assert_eq!(outcome.label(), "rejected_client");
}

#[tokio::test]
async fn test_slow_server_times_out() {
    setup_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let client = client_for(server.uri(), 1);
    let outcome = client.register(&record(), &RegistrationContext::default(), AttemptSource::Sweep).await;
    assert_eq!(outcome, RegistrationOutcome::NetworkFailure(NetworkFailureReason::Timeout));
}

#[tokio::test]
async fn test_closed_port_is_network_failure() {
    setup_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(format!("http://{addr}/api/push/token"), 5);
    let outcome = client.register(&record(), &RegistrationContext::default(), AttemptSource::Retry).await;
    assert!(matches!(outcome, RegistrationOutcome::NetworkFailure(NetworkFailureReason::Connect(_))));
}
