use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nf_common::{DeliveryJob, FailureClassification, QueuedJob};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub mod sqlite;

pub use error::BusError;
pub use sqlite::SqliteBus;

pub type Result<T> = std::result::Result<T, BusError>;

/// Bus metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct BusMetrics {
    /// Approximate number of jobs visible on the topic (pending)
    pub pending_jobs: u64,
    /// Approximate number of jobs currently being processed (in-flight)
    pub in_flight_jobs: u64,
    /// Topic identifier
    pub topic: String,
}

/// A job that exceeded its attempt ceiling or failed schema validation,
/// parked on the channel's dead-letter topic with its last classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: DeliveryJob,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClassification>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        job: DeliveryJob,
        reason: impl Into<String>,
        classification: Option<FailureClassification>,
    ) -> Self {
        Self {
            job,
            reason: reason.into(),
            classification,
            failed_at: Utc::now(),
        }
    }
}

/// Trait for consuming delivery jobs from a topic
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Topic this consumer reads from
    fn identifier(&self) -> &str;

    /// Poll for visible jobs, at most one per site partition
    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedJob>>;

    /// Acknowledge a job (remove from topic)
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Negative acknowledge a job (make visible again after delay)
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Extend visibility timeout for an in-flight job
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Check if the consumer is healthy
    fn is_healthy(&self) -> bool;

    /// Stop the consumer
    async fn stop(&self);

    /// Get topic metrics (pending/in-flight counts)
    async fn metrics(&self) -> Result<Option<BusMetrics>> {
        Ok(None)
    }
}

/// Trait for publishing delivery jobs to a topic
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Topic this publisher writes to
    fn identifier(&self) -> &str;

    /// Publish a job, visible immediately. Returns the dedup key.
    async fn publish(&self, job: &DeliveryJob) -> Result<String>;

    /// Publish a job that becomes visible no earlier than now + delay.
    /// This is the re-enqueue mechanism for scheduled retries.
    async fn publish_delayed(&self, job: &DeliveryJob, delay: Duration) -> Result<String>;
}

/// Sink for jobs that are done retrying or failed validation
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish_dead_letter(&self, dead: &DeadLetter) -> Result<String>;
}

/// Combined consumer and publisher for the embedded bus
#[async_trait]
pub trait EmbeddedBus: BusConsumer + BusPublisher {
    /// Initialize the bus schema (create tables, etc.)
    async fn init_schema(&self) -> Result<()>;
}
