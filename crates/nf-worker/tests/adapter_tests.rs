//! HttpProviderAdapter Unit Tests
//!
//! Tests for:
//! - Successful accepted / synchronous-delivered responses
//! - HTTP status code classification
//! - Auth codes forced to AUTH classification
//! - Signing and bearer auth headers
//! - Timeout classification

use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nf_common::{
    FailureClassification, NormalizedRequest, NormalizedResult, NotificationChannel,
    SiteCredentials,
};
use nf_worker::{ChannelAdapter, HttpAdapterConfig, HttpProviderAdapter};

fn adapter_for(endpoint: &str) -> HttpProviderAdapter {
    HttpProviderAdapter::new(
        NotificationChannel::Email,
        HttpAdapterConfig {
            endpoint: endpoint.to_string(),
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
        },
    )
}

fn credentials() -> SiteCredentials {
    SiteCredentials {
        api_key: Some("site-key".to_string()),
        from_address: Some("noreply@site.io".to_string()),
        session_name: None,
        endpoint: None,
        signing_secret: None,
    }
}

fn request() -> NormalizedRequest {
    NormalizedRequest {
        recipient: "a@x.io".to_string(),
        subject: Some("hello".to_string()),
        body: Some("world".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_accepted_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "prov-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    assert_eq!(result, NormalizedResult::Accepted);
}

#[tokio::test]
async fn test_synchronous_delivery_report() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"delivered": true})))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    assert_eq!(result, NormalizedResult::Delivered);
}

#[tokio::test]
async fn test_bearer_auth_header_is_sent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/send"))
        .and(header("Authorization", "Bearer site-key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    assert_eq!(result, NormalizedResult::Accepted);
}

#[tokio::test]
async fn test_signing_headers_when_secret_present() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/send"))
        .and(header_exists("X-NF-SIGNATURE"))
        .and(header_exists("X-NF-TIMESTAMP"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let mut creds = credentials();
    creds.signing_secret = Some("secret".to_string());
    let result = adapter.send(&creds, &request()).await;

    assert_eq!(result, NormalizedResult::Accepted);
}

#[tokio::test]
async fn test_401_classifies_as_auth() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure {
            classification,
            code,
            ..
        } => {
            assert_eq!(classification, FailureClassification::Auth);
            assert_eq!(code.as_deref(), Some("401"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_429_classifies_as_rate_limit_with_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure {
            classification,
            retry_after,
            ..
        } => {
            assert_eq!(classification, FailureClassification::RateLimit);
            assert_eq!(retry_after, Some(Duration::from_secs(30)));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_429_without_retry_after_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure {
            classification,
            retry_after,
            ..
        } => {
            assert_eq!(classification, FailureClassification::RateLimit);
            assert_eq!(retry_after, None);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_400_classifies_as_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure { classification, .. } => {
            assert_eq!(classification, FailureClassification::Permanent);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_500_classifies_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure { classification, .. } => {
            assert_eq!(classification, FailureClassification::Transient);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_classifies_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let adapter = adapter_for(&format!("{}/send", server.uri()));
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure {
            classification,
            code,
            ..
        } => {
            assert_eq!(classification, FailureClassification::Transient);
            assert_eq!(code.as_deref(), Some("TIMEOUT"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tenant_endpoint_override_wins() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tenant-endpoint"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // Platform endpoint points nowhere useful; the tenant override is used
    let adapter = adapter_for("http://127.0.0.1:1/never");
    let mut creds = credentials();
    creds.endpoint = Some(format!("{}/tenant-endpoint", server.uri()));
    let result = adapter.send(&creds, &request()).await;

    assert_eq!(result, NormalizedResult::Accepted);
}

#[tokio::test]
async fn test_missing_endpoint_is_permanent() {
    let adapter = adapter_for("");
    let result = adapter.send(&credentials(), &request()).await;

    match result {
        NormalizedResult::Failure {
            classification,
            code,
            ..
        } => {
            assert_eq!(classification, FailureClassification::Permanent);
            assert_eq!(code.as_deref(), Some("NO_ENDPOINT"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
