use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Channels & Delivery Status
// ============================================================================

/// Notification delivery channel.
///
/// Mirrored as a TEXT domain in the database; `as_str`/`parse` is the single
/// codec used by both serde and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    Email,
    Whatsapp,
    Sms,
    Push,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 4] = [
        NotificationChannel::Email,
        NotificationChannel::Whatsapp,
        NotificationChannel::Sms,
        NotificationChannel::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "EMAIL",
            NotificationChannel::Whatsapp => "WHATSAPP",
            NotificationChannel::Sms => "SMS",
            NotificationChannel::Push => "PUSH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EMAIL" => Some(NotificationChannel::Email),
            "WHATSAPP" => Some(NotificationChannel::Whatsapp),
            "SMS" => Some(NotificationChannel::Sms),
            "PUSH" => Some(NotificationChannel::Push),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery lifecycle status.
///
/// RETRYING is the single non-terminal in-flight retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Scheduled,
    Retrying,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Rejected,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Scheduled => "SCHEDULED",
            DeliveryStatus::Retrying => "RETRYING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Bounced => "BOUNCED",
            DeliveryStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(DeliveryStatus::Pending),
            "SCHEDULED" => Some(DeliveryStatus::Scheduled),
            "RETRYING" => Some(DeliveryStatus::Retrying),
            "SENT" => Some(DeliveryStatus::Sent),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "FAILED" => Some(DeliveryStatus::Failed),
            "BOUNCED" => Some(DeliveryStatus::Bounced),
            "REJECTED" => Some(DeliveryStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Failed
                | DeliveryStatus::Bounced
                | DeliveryStatus::Rejected
        )
    }

    /// Whether `next` is a valid transition out of `self`.
    ///
    /// Terminal states admit nothing; an invalid pair must never mutate the
    /// stored status (the history still records the attempt).
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match self {
            Pending => matches!(next, Sent | Failed | Rejected | Retrying),
            Scheduled => matches!(next, Pending | Rejected),
            Retrying => matches!(next, Sent | Failed | Rejected | Retrying),
            Sent => matches!(next, Delivered | Bounced | Failed),
            Delivered | Failed | Bounced | Rejected => false,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which component wrote a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistorySource {
    Api,
    Trigger,
    Worker,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistorySource::Api => "API",
            HistorySource::Trigger => "TRIGGER",
            HistorySource::Worker => "WORKER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "API" => Some(HistorySource::Api),
            "TRIGGER" => Some(HistorySource::Trigger),
            "WORKER" => Some(HistorySource::Worker),
            _ => None,
        }
    }
}

// ============================================================================
// Bus Payload
// ============================================================================

/// The bus payload that triggers a worker to execute an intent.
///
/// Carries identifiers only - no secrets, no recipient PII. The worker
/// rehydrates everything else from the message log. Wire format is camelCase
/// with snake_case aliases accepted for producer compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    #[serde(alias = "message_id")]
    pub message_id: String,
    #[serde(alias = "site_id")]
    pub site_id: Uuid,
    pub channel: NotificationChannel,
    /// 1-based attempt counter; workers must be idempotent on
    /// (site_id, message_id, attempt).
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

impl DeliveryJob {
    pub fn first_attempt(message_id: impl Into<String>, site_id: Uuid, channel: NotificationChannel) -> Self {
        Self {
            message_id: message_id.into(),
            site_id,
            channel,
            attempt: 1,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            message_id: self.message_id.clone(),
            site_id: self.site_id,
            channel: self.channel,
            attempt: self.attempt + 1,
        }
    }
}

/// A job received from the bus with tracking metadata.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: DeliveryJob,
    pub receipt_handle: String,
    pub topic: String,
}

// ============================================================================
// Adapter Contract
// ============================================================================

/// Failure classification returned by channel adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClassification {
    /// Invalid recipient, malformed content, unsupported operation. No retry.
    Permanent,
    /// Provider rate/quota limit. Exponential backoff with jitter.
    RateLimit,
    /// Network, 5xx, timeout. Standard backoff.
    Transient,
    /// Provider 401/403-equivalents or credential resolution failure.
    /// Never retried, regardless of status-code ambiguity.
    Auth,
}

impl FailureClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClassification::Permanent => "PERMANENT",
            FailureClassification::RateLimit => "RATE_LIMIT",
            FailureClassification::Transient => "TRANSIENT",
            FailureClassification::Auth => "AUTH",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureClassification::RateLimit | FailureClassification::Transient
        )
    }
}

/// Provider-agnostic send request handed to a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub media_urls: Vec<String>,
    pub from_address: Option<String>,
    pub session_name: Option<String>,
    pub caption: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Provider-agnostic outcome of a channel adapter call.
///
/// Adapters never leak provider-specific error types upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedResult {
    /// Provider accepted the message for asynchronous delivery.
    Accepted,
    /// Provider confirmed delivery synchronously.
    Delivered,
    Failure {
        classification: FailureClassification,
        code: Option<String>,
        message: String,
        /// Provider-requested minimum delay before the next attempt, e.g.
        /// a Retry-After header. Takes precedence over computed backoff.
        retry_after: Option<Duration>,
    },
}

impl NormalizedResult {
    pub fn failure(
        classification: FailureClassification,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        NormalizedResult::Failure {
            classification,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn failure_with_retry_after(
        classification: FailureClassification,
        code: Option<String>,
        message: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        NormalizedResult::Failure {
            classification,
            code,
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

/// Per-site provider credentials resolved at send time.
///
/// Never serialized into bus payloads.
#[derive(Debug, Clone, Default)]
pub struct SiteCredentials {
    pub api_key: Option<String>,
    pub from_address: Option<String>,
    pub session_name: Option<String>,
    /// Provider endpoint override; falls back to the channel's configured
    /// platform endpoint.
    pub endpoint: Option<String>,
    /// Secret for HMAC-SHA256 request signing, when the provider expects it.
    pub signing_secret: Option<String>,
}

impl SiteCredentials {
    pub fn has_key(&self) -> bool {
        self.api_key.as_ref().map(|k| !k.is_empty()).unwrap_or(false)
    }
}

// ============================================================================
// Audit Stamps
// ============================================================================

/// Embedded audit metadata shared by persisted entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuditStamps {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_nothing() {
        use DeliveryStatus::*;
        for terminal in [Delivered, Failed, Bounced, Rejected] {
            for next in [
                Pending, Scheduled, Retrying, Sent, Delivered, Failed, Bounced, Rejected,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} should be invalid"
                );
            }
        }
    }

    #[test]
    fn allowed_transitions() {
        use DeliveryStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Retrying));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Scheduled.can_transition_to(Pending));
        assert!(Scheduled.can_transition_to(Rejected));
        assert!(Retrying.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Bounced));
        assert!(Sent.can_transition_to(Failed));
    }

    #[test]
    fn disallowed_transitions() {
        use DeliveryStatus::*;
        assert!(!Pending.can_transition_to(Delivered));
        assert!(!Pending.can_transition_to(Scheduled));
        assert!(!Pending.can_transition_to(Bounced));
        assert!(!Scheduled.can_transition_to(Sent));
        assert!(!Scheduled.can_transition_to(Retrying));
        assert!(!Sent.can_transition_to(Retrying));
        assert!(!Sent.can_transition_to(Pending));
    }

    #[test]
    fn status_codec_round_trips() {
        use DeliveryStatus::*;
        for status in [
            Pending, Scheduled, Retrying, Sent, Delivered, Failed, Bounced, Rejected,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("nonsense"), None);
    }

    #[test]
    fn delivery_job_accepts_snake_case_site_id() {
        let json = r#"{"message_id":"m1","site_id":"7b7f5d2e-54c1-4d15-9a3e-0f60a1b2c3d4","channel":"EMAIL"}"#;
        let job: DeliveryJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.message_id, "m1");
        assert_eq!(job.channel, NotificationChannel::Email);
        assert_eq!(job.attempt, 1);

        let camel = serde_json::to_string(&job).unwrap();
        assert!(camel.contains("\"messageId\""));
        assert!(camel.contains("\"siteId\""));
    }

    #[test]
    fn auth_is_never_retryable() {
        assert!(!FailureClassification::Auth.is_retryable());
        assert!(!FailureClassification::Permanent.is_retryable());
        assert!(FailureClassification::RateLimit.is_retryable());
        assert!(FailureClassification::Transient.is_retryable());
    }
}
