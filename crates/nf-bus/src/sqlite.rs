use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{BusConsumer, BusError, BusMetrics, BusPublisher, DeadLetter, DeadLetterSink, EmbeddedBus, Result};
use nf_common::{DeliveryJob, QueuedJob};

/// SQLite-backed topic that mimics a partitioned FIFO queue for embedded mode.
///
/// Partition key is `site_id`: at most one job per site is handed out while a
/// previous one is in flight, which preserves per-tenant ordering. The same
/// table backs the channel's dead-letter topic.
pub struct SqliteBus {
    pool: Pool<Sqlite>,
    topic: String,
    dlq_topic: Option<String>,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl SqliteBus {
    pub fn new(
        pool: Pool<Sqlite>,
        topic: String,
        dlq_topic: Option<String>,
        visibility_timeout_seconds: u32,
    ) -> Self {
        Self {
            pool,
            topic,
            dlq_topic,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    /// Create the bus schema
    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bus_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                site_id TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0,
                UNIQUE(topic, dedup_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient polling
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bus_visible
            ON bus_messages (topic, visible_at, site_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(topic = %self.topic, "SQLite bus schema initialized");
        Ok(())
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn dedup_key(job: &DeliveryJob) -> String {
        format!("{}:{}", job.message_id, job.attempt)
    }

    async fn insert_message(
        &self,
        topic: &str,
        dedup_key: &str,
        site_id: &str,
        payload: &str,
        visible_at: i64,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();

        // Dedup on (topic, dedup_key)
        let existing = sqlx::query("SELECT id FROM bus_messages WHERE topic = ? AND dedup_key = ?")
            .bind(topic)
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;

        if existing.is_some() {
            debug!(
                dedup_key = %dedup_key,
                topic = %topic,
                "Duplicate job detected, skipping"
            );
            return Ok(false);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO bus_messages (topic, dedup_key, site_id, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (topic, dedup_key) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(dedup_key)
        .bind(site_id)
        .bind(visible_at)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    /// Move a payload that failed deserialization to the dead-letter topic.
    async fn quarantine_poison(&self, row_id: i64, raw_payload: &str, error: &str) -> Result<()> {
        let Some(ref dlq) = self.dlq_topic else {
            warn!(topic = %self.topic, error = %error, "Poison message with no DLQ configured, dropping");
            sqlx::query("DELETE FROM bus_messages WHERE id = ?")
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        };

        let body = serde_json::json!({
            "rawPayload": raw_payload,
            "reason": format!("deserialization failed: {}", error),
            "failedAt": Utc::now(),
        });
        let dedup_key = format!("poison:{}", row_id);
        self.insert_message(dlq, &dedup_key, "unknown", &body.to_string(), Utc::now().timestamp_millis())
            .await?;

        sqlx::query("DELETE FROM bus_messages WHERE id = ?")
            .bind(row_id)
            .execute(&self.pool)
            .await?;

        warn!(topic = %self.topic, dlq = %dlq, error = %error, "Poison message quarantined");
        Ok(())
    }

    /// Fetch raw dead-letter payloads, oldest first. Admin/test helper.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<serde_json::Value>> {
        let Some(ref dlq) = self.dlq_topic else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT payload FROM bus_messages WHERE topic = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(dlq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut payloads = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            payloads.push(serde_json::from_str(&payload)?);
        }
        Ok(payloads)
    }
}

#[async_trait]
impl BusConsumer for SqliteBus {
    fn identifier(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }

        let now = Utc::now().timestamp_millis();
        let new_visible_at = now + (self.visibility_timeout_seconds as i64) * 1_000;

        // Take the oldest visible job per site partition, skipping any site
        // that still has a job in flight - per-site ordering depends on it.
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT m.id, m.payload,
                       ROW_NUMBER() OVER (PARTITION BY m.site_id ORDER BY m.id) AS rn
                FROM bus_messages m
                WHERE m.topic = ? AND m.visible_at <= ?
                  AND NOT EXISTS (
                      SELECT 1 FROM bus_messages f
                      WHERE f.topic = m.topic AND f.site_id = m.site_id
                        AND f.receipt_handle IS NOT NULL AND f.visible_at > ?
                  )
            )
            SELECT id, payload
            FROM eligible
            WHERE rn = 1
            LIMIT ?
            "#,
        )
        .bind(&self.topic)
        .bind(now)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());

        for row in rows {
            let row_id: i64 = row.get("id");
            let payload: String = row.get("payload");

            let receipt_handle = self.generate_receipt_handle();

            let updated = sqlx::query(
                r#"
                UPDATE bus_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND topic = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(row_id)
            .bind(&self.topic)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                // Another consumer grabbed this job
                continue;
            }

            let job: DeliveryJob = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    self.quarantine_poison(row_id, &payload, &e.to_string()).await?;
                    continue;
                }
            };

            jobs.push(QueuedJob {
                job,
                receipt_handle,
                topic: self.topic.clone(),
            });
        }

        if !jobs.is_empty() {
            debug!(topic = %self.topic, count = jobs.len(), "Polled jobs from bus");
        }

        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM bus_messages WHERE receipt_handle = ? AND topic = ?",
        )
        .bind(receipt_handle)
        .bind(&self.topic)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                topic = %self.topic,
                "ACK failed - job not found or already deleted"
            );
            return Err(BusError::NotFound(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, topic = %self.topic, "Job acknowledged");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay = delay_seconds.unwrap_or(0) as i64;
        let new_visible_at = Utc::now().timestamp_millis() + delay * 1_000;

        let result = sqlx::query(
            r#"
            UPDATE bus_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ? AND topic = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.topic)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                topic = %self.topic,
                "NACK failed - job not found"
            );
            return Err(BusError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            topic = %self.topic,
            delay_seconds = delay,
            "Job negative acknowledged"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Utc::now().timestamp_millis() + (seconds as i64) * 1_000;

        let result = sqlx::query(
            r#"
            UPDATE bus_messages
            SET visible_at = ?
            WHERE receipt_handle = ? AND topic = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.topic)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BusError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            topic = %self.topic,
            seconds = seconds,
            "Visibility extended"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(topic = %self.topic, "SQLite bus consumer stopped");
    }

    async fn metrics(&self) -> Result<Option<BusMetrics>> {
        let now = Utc::now().timestamp_millis();

        let pending_row = sqlx::query(
            "SELECT COUNT(*) as count FROM bus_messages WHERE topic = ? AND visible_at <= ? AND receipt_handle IS NULL",
        )
        .bind(&self.topic)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let pending_jobs: i64 = pending_row.get("count");

        let in_flight_row = sqlx::query(
            "SELECT COUNT(*) as count FROM bus_messages WHERE topic = ? AND receipt_handle IS NOT NULL AND visible_at > ?",
        )
        .bind(&self.topic)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let in_flight_jobs: i64 = in_flight_row.get("count");

        Ok(Some(BusMetrics {
            pending_jobs: pending_jobs as u64,
            in_flight_jobs: in_flight_jobs as u64,
            topic: self.topic.clone(),
        }))
    }
}

#[async_trait]
impl BusPublisher for SqliteBus {
    fn identifier(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, job: &DeliveryJob) -> Result<String> {
        self.publish_delayed(job, Duration::ZERO).await
    }

    async fn publish_delayed(&self, job: &DeliveryJob, delay: Duration) -> Result<String> {
        let payload = serde_json::to_string(job)?;
        let dedup_key = Self::dedup_key(job);
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let inserted = self
            .insert_message(
                &self.topic,
                &dedup_key,
                &job.site_id.to_string(),
                &payload,
                visible_at,
            )
            .await?;

        if inserted {
            debug!(
                message_id = %job.message_id,
                site_id = %job.site_id,
                attempt = job.attempt,
                topic = %self.topic,
                delay_secs = delay.as_secs(),
                "Job published to bus"
            );
        }

        Ok(dedup_key)
    }
}

#[async_trait]
impl DeadLetterSink for SqliteBus {
    async fn publish_dead_letter(&self, dead: &DeadLetter) -> Result<String> {
        let Some(ref dlq) = self.dlq_topic else {
            return Err(BusError::Config(format!(
                "no DLQ topic configured for {}",
                self.topic
            )));
        };

        let payload = serde_json::to_string(dead)?;
        let dedup_key = format!("dlq:{}:{}", dead.job.message_id, dead.job.attempt);
        self.insert_message(
            dlq,
            &dedup_key,
            &dead.job.site_id.to_string(),
            &payload,
            Utc::now().timestamp_millis(),
        )
        .await?;

        warn!(
            message_id = %dead.job.message_id,
            site_id = %dead.job.site_id,
            dlq = %dlq,
            reason = %dead.reason,
            "Job moved to dead-letter topic"
        );

        Ok(dedup_key)
    }
}

#[async_trait]
impl EmbeddedBus for SqliteBus {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nf_common::{FailureClassification, NotificationChannel};
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn create_test_bus() -> SqliteBus {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let bus = SqliteBus::new(
            pool,
            "notif.email".to_string(),
            Some("notif.email.dlq".to_string()),
            30,
        );
        bus.init_schema().await.unwrap();
        bus
    }

    fn test_job(message_id: &str, site_id: Uuid) -> DeliveryJob {
        DeliveryJob::first_attempt(message_id, site_id, NotificationChannel::Email)
    }

    #[tokio::test]
    async fn test_publish_and_poll() {
        let bus = create_test_bus().await;
        let site = Uuid::new_v4();

        bus.publish(&test_job("m1", site)).await.unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.message_id, "m1");
        assert_eq!(jobs[0].job.attempt, 1);

        bus.ack(&jobs[0].receipt_handle).await.unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_nack_with_delay() {
        let bus = create_test_bus().await;
        let site = Uuid::new_v4();

        bus.publish(&test_job("m2", site)).await.unwrap();
        let jobs = bus.poll(10).await.unwrap();

        bus.nack(&jobs[0].receipt_handle, Some(60)).await.unwrap();

        // Delayed - not visible yet
        let jobs = bus.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_per_site_fifo() {
        let bus = create_test_bus().await;
        let site = Uuid::new_v4();

        bus.publish(&test_job("a", site)).await.unwrap();
        bus.publish(&test_job("b", site)).await.unwrap();

        // Only the first job of the partition is handed out
        let jobs = bus.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.message_id, "a");

        // While "a" is in flight the partition stays blocked
        let blocked = bus.poll(10).await.unwrap();
        assert!(blocked.is_empty());

        bus.ack(&jobs[0].receipt_handle).await.unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.message_id, "b");
    }

    #[tokio::test]
    async fn test_sites_poll_independently() {
        let bus = create_test_bus().await;
        let site_a = Uuid::new_v4();
        let site_b = Uuid::new_v4();

        bus.publish(&test_job("a1", site_a)).await.unwrap();
        bus.publish(&test_job("b1", site_b)).await.unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_deduplication_on_message_and_attempt() {
        let bus = create_test_bus().await;
        let site = Uuid::new_v4();
        let job = test_job("dup", site);

        bus.publish(&job).await.unwrap();
        bus.publish(&job).await.unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        bus.ack(&jobs[0].receipt_handle).await.unwrap();

        // A later attempt is a distinct bus message
        bus.publish(&job.next_attempt()).await.unwrap();
        let jobs = bus.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.attempt, 2);
    }

    #[tokio::test]
    async fn test_delayed_publish_not_visible_early() {
        let bus = create_test_bus().await;
        let site = Uuid::new_v4();

        bus.publish_delayed(&test_job("later", site), Duration::from_secs(120))
            .await
            .unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_publish() {
        let bus = create_test_bus().await;
        let site = Uuid::new_v4();
        let job = test_job("doomed", site);

        let dead = DeadLetter::new(
            job,
            "max attempts exceeded",
            Some(FailureClassification::Transient),
        );
        bus.publish_dead_letter(&dead).await.unwrap();

        let letters = bus.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0]["reason"], "max attempts exceeded");
        assert_eq!(letters[0]["classification"], "TRANSIENT");
    }

    #[tokio::test]
    async fn test_poison_payload_routed_to_dlq() {
        let bus = create_test_bus().await;

        // Inject a payload that does not deserialize as a DeliveryJob
        bus.insert_message(
            "notif.email",
            "poison-key",
            &Uuid::new_v4().to_string(),
            "{\"not\": \"a job\"}",
            Utc::now().timestamp_millis(),
        )
        .await
        .unwrap();

        let jobs = bus.poll(10).await.unwrap();
        assert!(jobs.is_empty());

        let letters = bus.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0]["reason"]
            .as_str()
            .unwrap()
            .contains("deserialization failed"));
    }
}
