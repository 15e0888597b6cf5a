//! SQLite Message Log Store
//!
//! Embedded-mode implementation. Status columns use the TEXT codec of the
//! status/channel enums; timestamps are stored as epoch milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::entity::{
    ListFilter, MessageLog, MessageStatusHistory, NotificationIntent, NotificationPayload, Page,
    TenantChannelConfig,
};
use crate::{
    emit_status_metric, InsertOutcome, MessageLogStore, Result, StoreError, TenantConfigStore,
    UpdateOutcome,
};
use nf_common::{AuditStamps, DeliveryStatus, HistorySource, NotificationChannel};

/// SQLite implementation of the message log store and tenant config store.
pub struct SqliteMessageLogStore {
    pool: SqlitePool,
}

impl SqliteMessageLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<MessageLog> {
        let site_id: String = row.get("site_id");
        let site_id = Uuid::parse_str(&site_id)
            .map_err(|e| StoreError::Unavailable(format!("corrupt site_id: {e}")))?;

        let channel: String = row.get("channel");
        let channel = NotificationChannel::parse(&channel)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown channel: {channel}")))?;

        let status: String = row.get("status");
        let status = DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown status: {status}")))?;

        let payload: NotificationPayload = serde_json::from_str(row.get("payload_json"))?;

        let scheduled_at: Option<i64> = row.get("scheduled_at");
        let created_at: i64 = row.get("created_at");
        let updated_at: i64 = row.get("updated_at");

        Ok(MessageLog {
            message_id: row.get("message_id"),
            site_id,
            channel,
            recipient: row.get("recipient"),
            payload,
            status,
            retry_count: row.get("retry_count"),
            scheduled_at: scheduled_at.and_then(DateTime::from_timestamp_millis),
            last_error: row.get("last_error"),
            audit: AuditStamps {
                created_at: DateTime::from_timestamp_millis(created_at)
                    .ok_or_else(|| StoreError::Unavailable("invalid created_at".into()))?,
                updated_at: DateTime::from_timestamp_millis(updated_at)
                    .ok_or_else(|| StoreError::Unavailable("invalid updated_at".into()))?,
            },
        })
    }

    async fn fetch(
        &self,
        site_id: Uuid,
        message_id: &str,
    ) -> Result<Option<MessageLog>> {
        let row = sqlx::query(
            "SELECT site_id, message_id, channel, recipient, payload_json, status, retry_count, \
             scheduled_at, last_error, created_at, updated_at \
             FROM message_logs WHERE site_id = ? AND message_id = ?",
        )
        .bind(site_id.to_string())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::parse_row(&r)).transpose()
    }

    async fn append_history_tx(
        tx: &mut Transaction<'_, Sqlite>,
        message_id: &str,
        status: DeliveryStatus,
        error: Option<&str>,
        retry_count: i32,
        source: HistorySource,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_status_history (message_id, status, error_message, retry_count, source, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(error)
        .bind(retry_count)
        .bind(source.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageLogStore for SqliteMessageLogStore {
    async fn insert(&self, site_id: Uuid, intent: &NotificationIntent) -> Result<InsertOutcome> {
        let message_id = intent.effective_message_id();
        let status = intent.initial_status();
        let now = Utc::now().timestamp_millis();
        let payload_json = serde_json::to_string(&intent.payload)?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO message_logs (site_id, message_id, channel, recipient, payload_json, \
             status, retry_count, scheduled_at, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, NULL, ?, ?) \
             ON CONFLICT (site_id, message_id) DO NOTHING",
        )
        .bind(site_id.to_string())
        .bind(&message_id)
        .bind(intent.channel.as_str())
        .bind(&intent.recipient)
        .bind(&payload_json)
        .bind(status.as_str())
        .bind(intent.scheduled_at.map(|t| t.timestamp_millis()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Uniqueness collapses to idempotent success
            tx.rollback().await?;
            let existing = self
                .fetch(site_id, &message_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(message_id.clone()))?;
            debug!(
                site_id = %site_id,
                message_id = %message_id,
                "Duplicate intent, returning stored row"
            );
            return Ok(InsertOutcome::AlreadyExists(existing));
        }

        Self::append_history_tx(&mut tx, &message_id, status, None, 0, HistorySource::Api).await?;
        tx.commit().await?;

        emit_status_metric(intent.channel, status);

        let row = self
            .fetch(site_id, &message_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(message_id.clone()))?;

        debug!(
            site_id = %site_id,
            message_id = %message_id,
            status = %status,
            "Intent persisted"
        );
        Ok(InsertOutcome::Inserted(row))
    }

    async fn find(&self, site_id: Uuid, message_id: &str) -> Result<Option<MessageLog>> {
        self.fetch(site_id, message_id).await
    }

    async fn update_status(
        &self,
        site_id: Uuid,
        message_id: &str,
        new_status: DeliveryStatus,
        error: Option<&str>,
        retry_count: Option<i32>,
        source: HistorySource,
    ) -> Result<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, retry_count, channel FROM message_logs WHERE site_id = ? AND message_id = ?",
        )
        .bind(site_id.to_string())
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        let current_str: String = row.get("status");
        let current = DeliveryStatus::parse(&current_str)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown status: {current_str}")))?;
        let current_retry: i32 = row.get("retry_count");
        let channel_str: String = row.get("channel");
        let channel = NotificationChannel::parse(&channel_str)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown channel: {channel_str}")))?;

        if !current.can_transition_to(new_status) {
            // Attempted reality: the invalid attempt still lands in history,
            // the stored status does not move.
            Self::append_history_tx(
                &mut tx,
                message_id,
                new_status,
                error,
                current_retry,
                source,
            )
            .await?;
            tx.commit().await?;

            error!(
                site_id = %site_id,
                message_id = %message_id,
                current = %current,
                attempted = %new_status,
                "Invalid status transition rejected"
            );
            return Ok(UpdateOutcome::InvalidTransition {
                current,
                attempted: new_status,
            });
        }

        let effective_retry = retry_count.unwrap_or(current_retry);

        sqlx::query(
            "UPDATE message_logs SET status = ?, last_error = ?, retry_count = ?, updated_at = ? \
             WHERE site_id = ? AND message_id = ?",
        )
        .bind(new_status.as_str())
        .bind(error)
        .bind(effective_retry)
        .bind(Utc::now().timestamp_millis())
        .bind(site_id.to_string())
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        Self::append_history_tx(
            &mut tx,
            message_id,
            new_status,
            error,
            effective_retry,
            source,
        )
        .await?;
        tx.commit().await?;

        if source == HistorySource::Api {
            emit_status_metric(channel, new_status);
        }

        let updated = self
            .fetch(site_id, message_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        debug!(
            site_id = %site_id,
            message_id = %message_id,
            from = %current,
            to = %new_status,
            retry_count = effective_retry,
            "Status updated"
        );
        Ok(UpdateOutcome::Applied(updated))
    }

    async fn list(&self, site_id: Uuid, filter: &ListFilter, page: Page) -> Result<Vec<MessageLog>> {
        let mut sql = String::from(
            "SELECT site_id, message_id, channel, recipient, payload_json, status, retry_count, \
             scheduled_at, last_error, created_at, updated_at \
             FROM message_logs WHERE site_id = ?",
        );
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.channel.is_some() {
            sql.push_str(" AND channel = ?");
        }
        if filter.recipient.is_some() {
            sql.push_str(" AND recipient = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, message_id LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql).bind(site_id.to_string());
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(channel) = filter.channel {
            query = query.bind(channel.as_str());
        }
        if let Some(ref recipient) = filter.recipient {
            query = query.bind(recipient.clone());
        }
        query = query.bind(page.limit()).bind(page.offset());

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn history(&self, site_id: Uuid, message_id: &str) -> Result<Vec<MessageStatusHistory>> {
        // Scope through the owning row; a foreign tenant sees nothing.
        if self.fetch(site_id, message_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT id, message_id, status, error_message, retry_count, source, timestamp \
             FROM message_status_history WHERE message_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let status = DeliveryStatus::parse(&status)
                .ok_or_else(|| StoreError::Unavailable(format!("unknown status: {status}")))?;
            let source: String = row.get("source");
            let source = HistorySource::parse(&source)
                .ok_or_else(|| StoreError::Unavailable(format!("unknown source: {source}")))?;
            let timestamp: i64 = row.get("timestamp");

            entries.push(MessageStatusHistory {
                id: row.get("id"),
                message_id: row.get("message_id"),
                status,
                error_message: row.get("error_message"),
                retry_count: row.get("retry_count"),
                source,
                timestamp: DateTime::from_timestamp_millis(timestamp)
                    .ok_or_else(|| StoreError::Unavailable("invalid timestamp".into()))?,
            });
        }
        Ok(entries)
    }

    async fn claim_due_scheduled(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<MessageLog>> {
        let mut tx = self.pool.begin().await?;

        // Claim and promote in one statement so concurrent shards cannot
        // double-promote. RETURNING gives back the claimed rows.
        let rows = sqlx::query(
            "UPDATE message_logs SET status = 'PENDING', updated_at = ? \
             WHERE rowid IN ( \
                 SELECT rowid FROM message_logs \
                 WHERE status = 'SCHEDULED' AND scheduled_at <= ? \
                 ORDER BY scheduled_at ASC LIMIT ? \
             ) \
             RETURNING site_id, message_id, channel, recipient, payload_json, status, retry_count, \
                       scheduled_at, last_error, created_at, updated_at",
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let log = Self::parse_row(row)?;
            Self::append_history_tx(
                &mut tx,
                &log.message_id,
                DeliveryStatus::Pending,
                None,
                log.retry_count,
                HistorySource::Api,
            )
            .await?;
            claimed.push(log);
        }
        tx.commit().await?;

        for log in &claimed {
            emit_status_metric(log.channel, DeliveryStatus::Pending);
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed due scheduled messages");
        }
        Ok(claimed)
    }

    async fn revert_to_scheduled(&self, site_id: Uuid, message_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE message_logs SET status = 'SCHEDULED', updated_at = ? \
             WHERE site_id = ? AND message_id = ? AND status = 'PENDING' \
             RETURNING retry_count, channel",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(site_id.to_string())
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = result else {
            tx.rollback().await?;
            return Err(StoreError::NotFound(message_id.to_string()));
        };

        let retry_count: i32 = row.get("retry_count");
        let channel_str: String = row.get("channel");

        Self::append_history_tx(
            &mut tx,
            message_id,
            DeliveryStatus::Scheduled,
            Some("publish failed, reverted to scheduled"),
            retry_count,
            HistorySource::Api,
        )
        .await?;
        tx.commit().await?;

        if let Some(channel) = NotificationChannel::parse(&channel_str) {
            emit_status_metric(channel, DeliveryStatus::Scheduled);
        }

        debug!(site_id = %site_id, message_id = %message_id, "Reverted to SCHEDULED");
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_logs (
                site_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                recipient TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                scheduled_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (site_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_message ON message_status_history (message_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_due ON message_logs (status, scheduled_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_channel_configs (
                site_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                api_key TEXT,
                from_address TEXT,
                session_name TEXT,
                endpoint TEXT,
                signing_secret TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (site_id, channel)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite message log schema initialized");
        Ok(())
    }
}

#[async_trait]
impl TenantConfigStore for SqliteMessageLogStore {
    async fn upsert(&self, config: &TenantChannelConfig) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO tenant_channel_configs \
             (site_id, channel, api_key, from_address, session_name, endpoint, signing_secret, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (site_id, channel) DO UPDATE SET \
               api_key = excluded.api_key, \
               from_address = excluded.from_address, \
               session_name = excluded.session_name, \
               endpoint = excluded.endpoint, \
               signing_secret = excluded.signing_secret, \
               updated_at = excluded.updated_at",
        )
        .bind(config.site_id.to_string())
        .bind(config.channel.as_str())
        .bind(&config.api_key)
        .bind(&config.from_address)
        .bind(&config.session_name)
        .bind(&config.endpoint)
        .bind(&config.signing_secret)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn channel_config(
        &self,
        site_id: Uuid,
        channel: NotificationChannel,
    ) -> Result<Option<TenantChannelConfig>> {
        let row = sqlx::query(
            "SELECT site_id, channel, api_key, from_address, session_name, endpoint, signing_secret, \
             created_at, updated_at \
             FROM tenant_channel_configs WHERE site_id = ? AND channel = ?",
        )
        .bind(site_id.to_string())
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let created_at: i64 = row.get("created_at");
        let updated_at: i64 = row.get("updated_at");

        Ok(Some(TenantChannelConfig {
            site_id,
            channel,
            api_key: row.get("api_key"),
            from_address: row.get("from_address"),
            session_name: row.get("session_name"),
            endpoint: row.get("endpoint"),
            signing_secret: row.get("signing_secret"),
            audit: AuditStamps {
                created_at: DateTime::from_timestamp_millis(created_at)
                    .ok_or_else(|| StoreError::Unavailable("invalid created_at".into()))?,
                updated_at: DateTime::from_timestamp_millis(updated_at)
                    .ok_or_else(|| StoreError::Unavailable("invalid updated_at".into()))?,
            },
        }))
    }
}
