//! NotifyFabric Message Log Store
//!
//! Durable, tenant-scoped record of each notification intent and its current
//! status, with an append-only status history. The history append for
//! API-sourced rows is the single point of delivery-metric emission, which
//! keeps the metric count equal to the number of distinct status transitions
//! even when a database trigger mirrors rows with source=TRIGGER.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nf_common::{DeliveryStatus, HistorySource, NotificationChannel};
use thiserror::Error;
use uuid::Uuid;

pub mod entity;
pub mod postgres;
pub mod sqlite;

pub use entity::{
    ListFilter, MessageLog, MessageStatusHistory, NotificationIntent, NotificationPayload, Page,
    TenantChannelConfig,
};
pub use postgres::PostgresMessageLogStore;
pub use sqlite::SqliteMessageLogStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Storage backend failure; retryable upstream as STORAGE_UNAVAILABLE.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(MessageLog),
    /// `(site_id, message_id)` already present; the stored row is returned
    /// without mutation.
    AlreadyExists(MessageLog),
}

impl InsertOutcome {
    pub fn row(&self) -> &MessageLog {
        match self {
            InsertOutcome::Inserted(row) => row,
            InsertOutcome::AlreadyExists(row) => row,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, InsertOutcome::AlreadyExists(_))
    }
}

/// Outcome of a status update attempt.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Transition was valid; the post-state row is returned.
    Applied(MessageLog),
    /// Transition was invalid; status unchanged, history row appended anyway.
    InvalidTransition {
        current: DeliveryStatus,
        attempted: DeliveryStatus,
    },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// Tenant-scoped message log operations.
///
/// Every query predicates on `site_id`; there is no cross-tenant read path.
#[async_trait]
pub trait MessageLogStore: Send + Sync {
    /// Idempotent insert. Appends the initial status history row for new rows.
    async fn insert(&self, site_id: Uuid, intent: &NotificationIntent) -> Result<InsertOutcome>;

    async fn find(&self, site_id: Uuid, message_id: &str) -> Result<Option<MessageLog>>;

    /// Atomic status update with same-transaction history append.
    ///
    /// Invalid transitions do not mutate `status` but still append a history
    /// row recording the attempt. `retry_count` replaces the stored value
    /// when given. Metrics are emitted only for applied API-sourced updates.
    async fn update_status(
        &self,
        site_id: Uuid,
        message_id: &str,
        new_status: DeliveryStatus,
        error: Option<&str>,
        retry_count: Option<i32>,
        source: HistorySource,
    ) -> Result<UpdateOutcome>;

    async fn list(&self, site_id: Uuid, filter: &ListFilter, page: Page) -> Result<Vec<MessageLog>>;

    /// Status history ascending by timestamp, scoped through the owning row.
    async fn history(&self, site_id: Uuid, message_id: &str) -> Result<Vec<MessageStatusHistory>>;

    /// Atomically claim due SCHEDULED rows and promote them to PENDING.
    ///
    /// The claim and the promotion are the same statement, so concurrent
    /// scheduler shards cannot double-promote a row.
    async fn claim_due_scheduled(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<MessageLog>>;

    /// Compensation for a failed publish after promotion: puts the row back
    /// to SCHEDULED so PENDING never exists without an enqueued job.
    async fn revert_to_scheduled(&self, site_id: Uuid, message_id: &str) -> Result<()>;

    /// Initialize schema (create tables if not exists)
    async fn init_schema(&self) -> Result<()>;
}

/// Per-site channel credential storage.
#[async_trait]
pub trait TenantConfigStore: Send + Sync {
    async fn upsert(&self, config: &TenantChannelConfig) -> Result<()>;

    async fn channel_config(
        &self,
        site_id: Uuid,
        channel: NotificationChannel,
    ) -> Result<Option<TenantChannelConfig>>;
}

/// Emit the delivery status-change metric.
///
/// Called exclusively from the history append of applied API-sourced
/// transitions - the single source of metric emission.
pub(crate) fn emit_status_metric(channel: NotificationChannel, status: DeliveryStatus) {
    metrics::counter!(
        "notifications.status_changes_total",
        "channel" => channel.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}
