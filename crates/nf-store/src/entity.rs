//! Message Log Entities
//!
//! One MessageLog row per notification intent, plus the append-only status
//! history stream that audits every transition attempt.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nf_common::{
    AuditStamps, DeliveryStatus, HistorySource, NormalizedRequest, NotificationChannel,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel-agnostic notification payload, persisted as a single JSON column.
///
/// Never carries provider API keys; credentials are resolved at send time
/// from tenant configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// A client-submitted request to deliver a notification.
#[derive(Debug, Clone)]
pub struct NotificationIntent {
    /// Client-supplied identifier; generated when absent. Stable for idempotency.
    pub message_id: Option<String>,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub payload: NotificationPayload,
    /// Present for scheduled intents; must lie in the future at intake.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NotificationIntent {
    /// Resolve the effective message id, generating one when the client
    /// did not supply it.
    pub fn effective_message_id(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    pub fn initial_status(&self) -> DeliveryStatus {
        if self.scheduled_at.is_some() {
            DeliveryStatus::Scheduled
        } else {
            DeliveryStatus::Pending
        }
    }
}

/// One row per notification intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLog {
    pub message_id: String,
    pub site_id: Uuid,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub payload: NotificationPayload,
    pub status: DeliveryStatus,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub audit: AuditStamps,
}

impl MessageLog {
    /// Build the provider-agnostic send request for this message.
    pub fn normalized_request(&self) -> NormalizedRequest {
        NormalizedRequest {
            recipient: self.recipient.clone(),
            subject: self.payload.subject.clone(),
            body: self.payload.body.clone(),
            media_urls: self.payload.media_urls.clone(),
            from_address: self.payload.from_address.clone(),
            session_name: self.payload.session_name.clone(),
            caption: self.payload.caption.clone(),
            metadata: self.payload.metadata.clone(),
        }
    }
}

/// Append-only audit entry. Records every transition attempt, including
/// invalid ones - the stored status only reflects valid transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusHistory {
    pub id: i64,
    pub message_id: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub source: HistorySource,
    pub timestamp: DateTime<Utc>,
}

/// Per-site provider configuration for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantChannelConfig {
    pub site_id: Uuid,
    pub channel: NotificationChannel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    #[serde(flatten)]
    pub audit: AuditStamps,
}

impl TenantChannelConfig {
    pub fn credentials(&self) -> nf_common::SiteCredentials {
        nf_common::SiteCredentials {
            api_key: self.api_key.clone(),
            from_address: self.from_address.clone(),
            session_name: self.session_name.clone(),
            endpoint: self.endpoint.clone(),
            signing_secret: self.signing_secret.clone(),
        }
    }
}

/// Filters for the tenant-scoped list operation.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<DeliveryStatus>,
    pub channel: Option<NotificationChannel>,
    pub recipient: Option<String>,
}

/// Page request for list operations.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page as i64) * (self.size as i64)
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}
