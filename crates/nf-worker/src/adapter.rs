//! Channel Adapters
//!
//! A channel adapter translates a NormalizedRequest into a specific provider
//! call and maps the outcome back to a NormalizedResult. Provider error
//! types never cross this boundary; every failure carries a classification,
//! an optional code, and a message.
//!
//! The shipped adapter is HTTP-based: each channel is configured with a
//! provider endpoint, requests carry the tenant's API key as a bearer token,
//! and responses are classified by status code. Requests are optionally
//! signed with HMAC-SHA256 using the tenant's signing secret.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use nf_common::{
    FailureClassification, NormalizedRequest, NormalizedResult, NotificationChannel,
    SiteCredentials,
};

/// Signature header attached when a signing secret is configured
pub const SIGNATURE_HEADER: &str = "X-NF-SIGNATURE";
/// Timestamp header paired with the signature
pub const TIMESTAMP_HEADER: &str = "X-NF-TIMESTAMP";

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for a provider request.
///
/// Signature payload = timestamp + body, hex-encoded.
fn sign_request(payload: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();

    let signature_payload = format!("{}{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signature_payload.as_bytes());
    let result = mac.finalize();

    let signature = hex::encode(result.into_bytes());

    (signature, timestamp)
}

/// Provider-agnostic sender for one channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn send(
        &self,
        credentials: &SiteCredentials,
        request: &NormalizedRequest,
    ) -> NormalizedResult;
}

/// Body posted to the provider endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderPayload<'a> {
    channel: &'a str,
    #[serde(flatten)]
    request: &'a NormalizedRequest,
}

/// Response from the provider endpoint
#[derive(Debug, Deserialize, Default)]
struct ProviderResponse {
    /// Provider reports synchronous delivery confirmation
    #[serde(default)]
    delivered: bool,
}

/// Configuration for the HTTP provider adapter
#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    /// Platform-level provider endpoint; overridable per tenant
    pub endpoint: String,
    /// Hard deadline per call
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP-based channel adapter with status-code classification.
pub struct HttpProviderAdapter {
    channel: NotificationChannel,
    client: Client,
    config: HttpAdapterConfig,
}

impl HttpProviderAdapter {
    pub fn new(channel: NotificationChannel, config: HttpAdapterConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        info!(
            channel = %channel,
            endpoint = %config.endpoint,
            timeout_ms = config.timeout.as_millis(),
            "HttpProviderAdapter initialized"
        );

        Self {
            channel,
            client,
            config,
        }
    }

    fn classify_status(status_code: u16) -> (FailureClassification, &'static str) {
        match status_code {
            // 401/403-equivalents are forced PERMANENT via AUTH, always
            401 | 403 => (FailureClassification::Auth, "Auth error"),
            429 => (FailureClassification::RateLimit, "Rate limited"),
            408 => (FailureClassification::Transient, "Request timeout"),
            400..=499 => (FailureClassification::Permanent, "Client error"),
            _ => (FailureClassification::Transient, "Server error"),
        }
    }
}

#[async_trait]
impl ChannelAdapter for HttpProviderAdapter {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(
        &self,
        credentials: &SiteCredentials,
        request: &NormalizedRequest,
    ) -> NormalizedResult {
        let endpoint = credentials
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(&self.config.endpoint);

        if endpoint.is_empty() {
            return NormalizedResult::failure(
                FailureClassification::Permanent,
                Some("NO_ENDPOINT".to_string()),
                format!("no provider endpoint configured for {}", self.channel),
            );
        }

        let payload = ProviderPayload {
            channel: self.channel.as_str(),
            request,
        };
        let payload_json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                return NormalizedResult::failure(
                    FailureClassification::Permanent,
                    Some("SERIALIZATION".to_string()),
                    format!("payload serialization failed: {e}"),
                );
            }
        };

        debug!(
            channel = %self.channel,
            endpoint = %endpoint,
            recipient = %request.recipient,
            has_api_key = credentials.has_key(),
            "Calling provider"
        );

        let mut http_request = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");

        if let Some(ref signing_secret) = credentials.signing_secret {
            let (signature, timestamp) = sign_request(&payload_json, signing_secret);
            http_request = http_request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        if let Some(ref api_key) = credentials.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        http_request = http_request.body(payload_json);

        match http_request.send().await {
            Ok(response) => {
                let status = response.status();
                let status_code = status.as_u16();

                if status.is_success() {
                    let delivered = response
                        .text()
                        .await
                        .ok()
                        .and_then(|body| serde_json::from_str::<ProviderResponse>(&body).ok())
                        .map(|r| r.delivered)
                        .unwrap_or(false);

                    debug!(
                        channel = %self.channel,
                        status_code = status_code,
                        delivered = delivered,
                        "Provider accepted message"
                    );
                    if delivered {
                        NormalizedResult::Delivered
                    } else {
                        NormalizedResult::Accepted
                    }
                } else {
                    let (classification, description) = Self::classify_status(status_code);

                    // Rate-limiting providers state their own minimum delay
                    let retry_after = (status_code == 429)
                        .then(|| {
                            response
                                .headers()
                                .get("Retry-After")
                                .and_then(|v| v.to_str().ok())
                                .and_then(|s| s.parse::<u64>().ok())
                                .map(Duration::from_secs)
                        })
                        .flatten();

                    warn!(
                        channel = %self.channel,
                        status_code = status_code,
                        classification = classification.as_str(),
                        retry_after_secs = retry_after.map(|d| d.as_secs()),
                        "Provider call failed"
                    );

                    let code = Some(status_code.to_string());
                    let message = format!("HTTP {}: {}", status_code, description);
                    match retry_after {
                        Some(delay) => NormalizedResult::failure_with_retry_after(
                            classification,
                            code,
                            message,
                            delay,
                        ),
                        None => NormalizedResult::failure(classification, code, message),
                    }
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!(channel = %self.channel, error = %e, "Provider request timeout");
                    NormalizedResult::failure(
                        FailureClassification::Transient,
                        Some("TIMEOUT".to_string()),
                        "request timeout",
                    )
                } else if e.is_connect() {
                    warn!(channel = %self.channel, error = %e, "Provider connection error");
                    NormalizedResult::failure(
                        FailureClassification::Transient,
                        Some("CONNECT".to_string()),
                        format!("connection error: {e}"),
                    )
                } else {
                    warn!(channel = %self.channel, error = %e, "Provider request failed");
                    NormalizedResult::failure(
                        FailureClassification::Transient,
                        None,
                        format!("request failed: {e}"),
                    )
                }
            }
        }
    }
}
