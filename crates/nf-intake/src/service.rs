//! Intake Service
//!
//! Validates intents per channel, persists them idempotently, and publishes
//! the first delivery attempt. The tenant is always supplied by the caller
//! from the authenticated principal, never taken from the intent itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nf_bus::BusPublisher;
use nf_common::{DeliveryJob, DeliveryStatus, HistorySource, NotificationChannel};
use nf_store::{
    ListFilter, MessageLog, MessageLogStore, MessageStatusHistory, NotificationIntent, Page,
    UpdateOutcome,
};

use crate::{IntakeError, Result};

const CANCELLED_REASON: &str = "CANCELLED";

/// Result of a single submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub row: MessageLog,
    /// True when `(site_id, message_id)` already existed; the stored state
    /// is returned unchanged.
    pub replay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkEntryStatus {
    Accepted,
    Replayed,
    Rejected,
}

/// Per-entry outcome for bulk submission; bulk is never all-or-nothing.
#[derive(Debug, Clone)]
pub struct BulkEntryOutcome {
    pub message_id: Option<String>,
    pub status: BulkEntryStatus,
    pub error: Option<String>,
    pub row: Option<MessageLog>,
}

pub struct IntakeService {
    store: Arc<dyn MessageLogStore>,
    publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>>,
}

impl IntakeService {
    pub fn new(
        store: Arc<dyn MessageLogStore>,
        publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>>,
    ) -> Self {
        Self { store, publishers }
    }

    /// Submit a one-shot intent: validate, persist, publish the first attempt.
    pub async fn submit(&self, site_id: Uuid, intent: &NotificationIntent) -> Result<SubmitOutcome> {
        validate_intent(intent)?;

        let outcome = self.store.insert(site_id, intent).await?;
        let replay = outcome.is_replay();
        let row = outcome.row().clone();

        // Publish for new PENDING rows, and re-publish on replay of a still
        // PENDING row: bus dedup absorbs it, and it repairs the case where a
        // client retried after a publish failure.
        if row.status == DeliveryStatus::Pending {
            let job = DeliveryJob::first_attempt(&row.message_id, site_id, row.channel);
            self.publish(&job).await?;
        }

        if replay {
            debug!(
                site_id = %site_id,
                message_id = %row.message_id,
                "Idempotent replay"
            );
        } else {
            info!(
                site_id = %site_id,
                message_id = %row.message_id,
                channel = %row.channel,
                status = %row.status,
                "Intent accepted"
            );
            metrics::counter!(
                "intake.intents_accepted_total",
                "channel" => row.channel.as_str()
            )
            .increment(1);
        }

        Ok(SubmitOutcome { row, replay })
    }

    /// Submit a scheduled intent; `when` must lie in the future.
    pub async fn submit_scheduled(
        &self,
        site_id: Uuid,
        intent: &NotificationIntent,
        when: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        if when <= Utc::now() {
            return Err(IntakeError::validation(
                "scheduled_at",
                "must be in the future",
            ));
        }

        let mut scheduled = intent.clone();
        scheduled.scheduled_at = Some(when);
        validate_intent(&scheduled)?;

        let outcome = self.store.insert(site_id, &scheduled).await?;
        let replay = outcome.is_replay();
        let row = outcome.row().clone();

        if !replay {
            info!(
                site_id = %site_id,
                message_id = %row.message_id,
                channel = %row.channel,
                scheduled_at = %when,
                "Scheduled intent accepted"
            );
            metrics::counter!(
                "intake.intents_scheduled_total",
                "channel" => row.channel.as_str()
            )
            .increment(1);
        }

        Ok(SubmitOutcome { row, replay })
    }

    /// Submit a batch with per-intent idempotency. A rejected entry does not
    /// affect its neighbours.
    pub async fn submit_bulk(
        &self,
        site_id: Uuid,
        intents: &[NotificationIntent],
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Vec<BulkEntryOutcome> {
        let mut outcomes = Vec::with_capacity(intents.len());

        for intent in intents {
            let result = match scheduled_for {
                Some(when) => self.submit_scheduled(site_id, intent, when).await,
                None => self.submit(site_id, intent).await,
            };

            outcomes.push(match result {
                Ok(submitted) => BulkEntryOutcome {
                    message_id: Some(submitted.row.message_id.clone()),
                    status: if submitted.replay {
                        BulkEntryStatus::Replayed
                    } else {
                        BulkEntryStatus::Accepted
                    },
                    error: None,
                    row: Some(submitted.row),
                },
                Err(e) => BulkEntryOutcome {
                    message_id: intent.message_id.clone(),
                    status: BulkEntryStatus::Rejected,
                    error: Some(e.to_string()),
                    row: None,
                },
            });
        }

        outcomes
    }

    /// Cancel a message; allowed only from PENDING, SCHEDULED, and RETRYING.
    pub async fn cancel(&self, site_id: Uuid, message_id: &str) -> Result<MessageLog> {
        let row = self
            .store
            .find(site_id, message_id)
            .await?
            .ok_or_else(|| IntakeError::NotFound(message_id.to_string()))?;

        if !matches!(
            row.status,
            DeliveryStatus::Pending | DeliveryStatus::Scheduled | DeliveryStatus::Retrying
        ) {
            return Err(IntakeError::NotCancellable { status: row.status });
        }

        match self
            .store
            .update_status(
                site_id,
                message_id,
                DeliveryStatus::Rejected,
                Some(CANCELLED_REASON),
                None,
                HistorySource::Api,
            )
            .await?
        {
            UpdateOutcome::Applied(row) => {
                info!(site_id = %site_id, message_id = %message_id, "Message cancelled");
                Ok(row)
            }
            UpdateOutcome::InvalidTransition { current, .. } => {
                // The message moved under us between the read and the update
                Err(IntakeError::NotCancellable { status: current })
            }
        }
    }

    pub async fn get(&self, site_id: Uuid, message_id: &str) -> Result<MessageLog> {
        self.store
            .find(site_id, message_id)
            .await?
            .ok_or_else(|| IntakeError::NotFound(message_id.to_string()))
    }

    pub async fn history(
        &self,
        site_id: Uuid,
        message_id: &str,
    ) -> Result<Vec<MessageStatusHistory>> {
        // A foreign tenant gets the same answer as a missing message
        if self.store.find(site_id, message_id).await?.is_none() {
            return Err(IntakeError::NotFound(message_id.to_string()));
        }
        Ok(self.store.history(site_id, message_id).await?)
    }

    pub async fn list(
        &self,
        site_id: Uuid,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Vec<MessageLog>> {
        Ok(self.store.list(site_id, filter, page).await?)
    }

    async fn publish(&self, job: &DeliveryJob) -> Result<()> {
        let publisher = self.publishers.get(&job.channel).ok_or_else(|| {
            IntakeError::Bus(format!("no publisher for channel {}", job.channel))
        })?;

        publisher.publish(job).await.map_err(|e| {
            warn!(
                message_id = %job.message_id,
                channel = %job.channel,
                error = %e,
                "Publish failed"
            );
            IntakeError::from(e)
        })?;
        Ok(())
    }
}

/// Per-channel intent validation.
fn validate_intent(intent: &NotificationIntent) -> Result<()> {
    if intent.recipient.trim().is_empty() {
        return Err(IntakeError::validation("recipient", "must not be empty"));
    }

    match intent.channel {
        NotificationChannel::Email => {
            if !intent.recipient.contains('@') {
                return Err(IntakeError::validation(
                    "recipient",
                    "must be an email address",
                ));
            }
            if intent.payload.subject.is_none() && intent.payload.body.is_none() {
                return Err(IntakeError::validation(
                    "payload",
                    "email requires a subject or a body",
                ));
            }
        }
        NotificationChannel::Sms | NotificationChannel::Whatsapp => {
            let digits = intent.recipient.trim_start_matches('+');
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(IntakeError::validation(
                    "recipient",
                    "must be a phone number",
                ));
            }
            if intent.payload.body.is_none() && intent.payload.media_urls.is_empty() {
                return Err(IntakeError::validation(
                    "payload",
                    "message body or media required",
                ));
            }
        }
        NotificationChannel::Push => {
            if intent.recipient.len() < 8 {
                return Err(IntakeError::validation(
                    "recipient",
                    "must be a device token",
                ));
            }
            if intent.payload.body.is_none() && intent.payload.subject.is_none() {
                return Err(IntakeError::validation(
                    "payload",
                    "push requires a title or a body",
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nf_store::NotificationPayload;

    fn intent(channel: NotificationChannel, recipient: &str) -> NotificationIntent {
        NotificationIntent {
            message_id: None,
            channel,
            recipient: recipient.to_string(),
            payload: NotificationPayload {
                body: Some("body".to_string()),
                ..Default::default()
            },
            scheduled_at: None,
        }
    }

    #[test]
    fn test_email_requires_address() {
        assert!(validate_intent(&intent(NotificationChannel::Email, "a@x.io")).is_ok());
        assert!(validate_intent(&intent(NotificationChannel::Email, "not-an-email")).is_err());
    }

    #[test]
    fn test_email_requires_content() {
        let mut bare = intent(NotificationChannel::Email, "a@x.io");
        bare.payload.body = None;
        assert!(validate_intent(&bare).is_err());

        bare.payload.subject = Some("s".to_string());
        assert!(validate_intent(&bare).is_ok());
    }

    #[test]
    fn test_phone_channels_require_phone_number() {
        assert!(validate_intent(&intent(NotificationChannel::Sms, "+15550001111")).is_ok());
        assert!(validate_intent(&intent(NotificationChannel::Whatsapp, "15550001111")).is_ok());
        assert!(validate_intent(&intent(NotificationChannel::Sms, "a@x.io")).is_err());
    }

    #[test]
    fn test_push_requires_token() {
        assert!(validate_intent(&intent(NotificationChannel::Push, "device-token-1")).is_ok());
        assert!(validate_intent(&intent(NotificationChannel::Push, "short")).is_err());
    }

    #[test]
    fn test_empty_recipient_rejected() {
        assert!(validate_intent(&intent(NotificationChannel::Email, "  ")).is_err());
    }
}
