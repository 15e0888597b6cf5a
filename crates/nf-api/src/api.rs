//! Notifications REST API
//!
//! Versioned `/v1` endpoints for submitting, observing, and cancelling
//! notifications. Every operation is idempotent by `(site_id, message_id)`
//! and tenant-scoped through the TenantContext extractor.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

use nf_common::NotificationChannel;
use nf_intake::{BulkEntryOutcome, BulkEntryStatus, IntakeService};
use nf_store::{
    ListFilter, MessageLog, MessageStatusHistory, NotificationIntent, NotificationPayload, Page,
};

use crate::error::ApiError;
use crate::tenant::TenantContext;

const MAX_BULK_SIZE: usize = 100;

/// Notifications service state
#[derive(Clone)]
pub struct ApiState {
    pub intake: Arc<IntakeService>,
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Request to submit a single notification.
///
/// Unknown fields are rejected, so a body that tries to carry `siteId` fails
/// validation instead of being silently ignored.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubmitNotificationRequest {
    /// Client-supplied identifier, stable for idempotency; generated when absent
    pub message_id: Option<String>,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub from_address: Option<String>,
    pub session_name: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubmitNotificationRequest {
    fn into_intent(self) -> NotificationIntent {
        NotificationIntent {
            message_id: self.message_id,
            channel: self.channel,
            recipient: self.recipient,
            payload: NotificationPayload {
                subject: self.subject,
                body: self.body,
                media_urls: self.media_urls,
                from_address: self.from_address,
                session_name: self.session_name,
                caption: self.caption,
                metadata: self.metadata,
            },
            scheduled_at: None,
        }
    }
}

/// Request to submit a scheduled notification
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduledNotificationRequest {
    pub message_id: Option<String>,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub from_address: Option<String>,
    pub session_name: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Delivery time; must lie in the future
    pub scheduled_at: DateTime<Utc>,
}

impl ScheduledNotificationRequest {
    fn split(self) -> (NotificationIntent, DateTime<Utc>) {
        let when = self.scheduled_at;
        let intent = NotificationIntent {
            message_id: self.message_id,
            channel: self.channel,
            recipient: self.recipient,
            payload: NotificationPayload {
                subject: self.subject,
                body: self.body,
                media_urls: self.media_urls,
                from_address: self.from_address,
                session_name: self.session_name,
                caption: self.caption,
                metadata: self.metadata,
            },
            scheduled_at: Some(when),
        };
        (intent, when)
    }
}

/// Bulk submission request; non-empty, at most 100 entries
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BulkNotificationRequest {
    pub notifications: Vec<SubmitNotificationRequest>,
}

/// Bulk scheduled submission request
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BulkScheduledNotificationRequest {
    pub notifications: Vec<SubmitNotificationRequest>,
    pub scheduled_at: DateTime<Utc>,
}

/// Query parameters for the notifications list
#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Filter by status
    pub status: Option<String>,
    /// Filter by channel
    pub channel: Option<String>,
    /// Filter by recipient
    pub recipient: Option<String>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Current state of a notification
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub message_id: String,
    pub channel: String,
    pub recipient: String,
    pub status: String,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<MessageLog> for NotificationResponse {
    fn from(row: MessageLog) -> Self {
        Self {
            message_id: row.message_id,
            channel: row.channel.as_str().to_string(),
            recipient: row.recipient,
            status: row.status.as_str().to_string(),
            retry_count: row.retry_count,
            scheduled_at: row.scheduled_at.map(|t| t.to_rfc3339()),
            last_error: row.last_error,
            subject: row.payload.subject,
            body: row.payload.body,
            created_at: row.audit.created_at.to_rfc3339(),
            updated_at: row.audit.updated_at.to_rfc3339(),
        }
    }
}

/// Submission result; `result` distinguishes fresh accepts from idempotent replays
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub result: String,
    pub notification: NotificationResponse,
}

/// Per-entry outcome of a bulk submission
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkEntryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<BulkEntryOutcome> for BulkEntryResponse {
    fn from(outcome: BulkEntryOutcome) -> Self {
        Self {
            message_id: outcome.message_id,
            result: match outcome.status {
                BulkEntryStatus::Accepted => "ACCEPTED".to_string(),
                BulkEntryStatus::Replayed => "IDEMPOTENT_REPLAY".to_string(),
                BulkEntryStatus::Rejected => "REJECTED".to_string(),
            },
            error: outcome.error,
        }
    }
}

/// Bulk submission response
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkResponse {
    pub results: Vec<BulkEntryResponse>,
    pub count: usize,
}

/// One status history entry
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub source: String,
    pub timestamp: String,
}

impl From<MessageStatusHistory> for HistoryEntryResponse {
    fn from(entry: MessageStatusHistory) -> Self {
        Self {
            status: entry.status.as_str().to_string(),
            error_message: entry.error_message,
            retry_count: entry.retry_count,
            source: entry.source.as_str().to_string(),
            timestamp: entry.timestamp.to_rfc3339(),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a single notification intent
#[utoipa::path(
    post,
    path = "",
    tag = "notifications",
    request_body = SubmitNotificationRequest,
    responses(
        (status = 201, description = "Notification accepted", body = SubmitResponse),
        (status = 200, description = "Idempotent replay of an existing notification", body = SubmitResponse),
        (status = 400, description = "Validation failed"),
        (status = 401, description = "Unauthenticated")
    ),
    security(("site_key" = []))
)]
pub async fn submit_notification(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Json(request): Json<SubmitNotificationRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let intent = request.into_intent();
    let outcome = state.intake.submit(tenant.site_id(), &intent).await?;

    let (status, result) = if outcome.replay {
        (StatusCode::OK, "IDEMPOTENT_REPLAY")
    } else {
        (StatusCode::CREATED, "ACCEPTED")
    };

    Ok((
        status,
        Json(SubmitResponse {
            result: result.to_string(),
            notification: outcome.row.into(),
        }),
    ))
}

/// Submit a batch of notification intents
#[utoipa::path(
    post,
    path = "/bulk",
    tag = "notifications",
    request_body = BulkNotificationRequest,
    responses(
        (status = 200, description = "Per-entry outcomes", body = BulkResponse),
        (status = 400, description = "Empty batch or batch too large")
    ),
    security(("site_key" = []))
)]
pub async fn submit_bulk(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Json(request): Json<BulkNotificationRequest>,
) -> Result<Json<BulkResponse>, ApiError> {
    validate_bulk_size(request.notifications.len())?;

    let intents: Vec<NotificationIntent> = request
        .notifications
        .into_iter()
        .map(|r| r.into_intent())
        .collect();

    let outcomes = state.intake.submit_bulk(tenant.site_id(), &intents, None).await;
    let results: Vec<BulkEntryResponse> = outcomes.into_iter().map(Into::into).collect();
    let count = results.len();

    Ok(Json(BulkResponse { results, count }))
}

/// Submit a single scheduled notification
#[utoipa::path(
    post,
    path = "/scheduled",
    tag = "notifications",
    request_body = ScheduledNotificationRequest,
    responses(
        (status = 201, description = "Scheduled notification accepted", body = SubmitResponse),
        (status = 200, description = "Idempotent replay", body = SubmitResponse),
        (status = 400, description = "Validation failed or scheduled_at not in the future")
    ),
    security(("site_key" = []))
)]
pub async fn submit_scheduled(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Json(request): Json<ScheduledNotificationRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let (intent, when) = request.split();
    let outcome = state
        .intake
        .submit_scheduled(tenant.site_id(), &intent, when)
        .await?;

    let (status, result) = if outcome.replay {
        (StatusCode::OK, "IDEMPOTENT_REPLAY")
    } else {
        (StatusCode::CREATED, "ACCEPTED")
    };

    Ok((
        status,
        Json(SubmitResponse {
            result: result.to_string(),
            notification: outcome.row.into(),
        }),
    ))
}

/// Submit a batch of scheduled notification intents
#[utoipa::path(
    post,
    path = "/scheduled/bulk",
    tag = "notifications",
    request_body = BulkScheduledNotificationRequest,
    responses(
        (status = 200, description = "Per-entry outcomes", body = BulkResponse),
        (status = 400, description = "Empty batch or batch too large")
    ),
    security(("site_key" = []))
)]
pub async fn submit_scheduled_bulk(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Json(request): Json<BulkScheduledNotificationRequest>,
) -> Result<Json<BulkResponse>, ApiError> {
    validate_bulk_size(request.notifications.len())?;

    let intents: Vec<NotificationIntent> = request
        .notifications
        .into_iter()
        .map(|r| r.into_intent())
        .collect();

    let outcomes = state
        .intake
        .submit_bulk(tenant.site_id(), &intents, Some(request.scheduled_at))
        .await;
    let results: Vec<BulkEntryResponse> = outcomes.into_iter().map(Into::into).collect();
    let count = results.len();

    Ok(Json(BulkResponse { results, count }))
}

/// Get the current state of a notification
#[utoipa::path(
    get,
    path = "/{message_id}",
    tag = "notifications",
    params(("message_id" = String, Path, description = "Message identifier")),
    responses(
        (status = 200, description = "Current state", body = NotificationResponse),
        (status = 404, description = "Not found")
    ),
    security(("site_key" = []))
)]
pub async fn get_notification(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Path(message_id): Path<String>,
) -> Result<Json<NotificationResponse>, ApiError> {
    let row = state.intake.get(tenant.site_id(), &message_id).await?;
    Ok(Json(row.into()))
}

/// List notifications for the tenant
#[utoipa::path(
    get,
    path = "",
    tag = "notifications",
    params(ListQuery),
    responses(
        (status = 200, description = "Notifications page", body = Vec<NotificationResponse>)
    ),
    security(("site_key" = []))
)]
pub async fn list_notifications(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationResponse>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            nf_common::DeliveryStatus::parse(s)
                .ok_or_else(|| ApiError::validation(format!("unknown status: {s}")))
        })
        .transpose()?;
    let channel = query
        .channel
        .as_deref()
        .map(|c| {
            NotificationChannel::parse(c)
                .ok_or_else(|| ApiError::validation(format!("unknown channel: {c}")))
        })
        .transpose()?;

    let filter = ListFilter {
        status,
        channel,
        recipient: query.recipient,
    };
    let page = Page {
        page: query.page.unwrap_or(0),
        size: query.size.unwrap_or(20).min(200),
    };

    let rows = state.intake.list(tenant.site_id(), &filter, page).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Get the status history of a notification, ascending
#[utoipa::path(
    get,
    path = "/{message_id}/history",
    tag = "notifications",
    params(("message_id" = String, Path, description = "Message identifier")),
    responses(
        (status = 200, description = "History entries ascending", body = Vec<HistoryEntryResponse>),
        (status = 404, description = "Not found")
    ),
    security(("site_key" = []))
)]
pub async fn get_history(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Path(message_id): Path<String>,
) -> Result<Json<Vec<HistoryEntryResponse>>, ApiError> {
    let entries = state.intake.history(tenant.site_id(), &message_id).await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

/// Cancel a notification that has not reached a final state
#[utoipa::path(
    delete,
    path = "/{message_id}",
    tag = "notifications",
    params(("message_id" = String, Path, description = "Message identifier")),
    responses(
        (status = 200, description = "Cancelled", body = NotificationResponse),
        (status = 404, description = "Not found"),
        (status = 409, description = "Already terminal"),
        (status = 422, description = "Not cancellable from the current state")
    ),
    security(("site_key" = []))
)]
pub async fn cancel_notification(
    State(state): State<ApiState>,
    tenant: TenantContext,
    Path(message_id): Path<String>,
) -> Result<Json<NotificationResponse>, ApiError> {
    let row = state.intake.cancel(tenant.site_id(), &message_id).await?;
    Ok(Json(row.into()))
}

fn validate_bulk_size(len: usize) -> Result<(), ApiError> {
    if len == 0 {
        return Err(ApiError::validation(
            "request must contain at least one notification",
        ));
    }
    if len > MAX_BULK_SIZE {
        return Err(ApiError::validation(format!(
            "batch size cannot exceed {MAX_BULK_SIZE} notifications"
        )));
    }
    Ok(())
}

/// Create the notifications router
pub fn notifications_router(state: ApiState) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(list_notifications, submit_notification))
        .routes(routes!(submit_bulk))
        .routes(routes!(submit_scheduled))
        .routes(routes!(submit_scheduled_bulk))
        .routes(routes!(get_notification, cancel_notification))
        .routes(routes!(get_history))
        .with_state(state)
}
