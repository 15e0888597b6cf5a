//! Channel Worker
//!
//! Consumes DeliveryJobs from one channel topic and drives each message
//! through the delivery lifecycle: hydrate from the message log, resolve
//! tenant credentials, call the channel adapter under a deadline, apply the
//! outcome through the status-transition validator, and schedule retries.
//!
//! The bus message is acked only after the store commit, so a crash between
//! commit and ack is absorbed by the idempotent ignore on redelivery.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use nf_bus::{BusConsumer, BusError, BusPublisher, DeadLetter, DeadLetterSink};
use nf_common::logging::delivery_span;
use nf_common::{
    DeliveryJob, DeliveryStatus, FailureClassification, HistorySource, NormalizedResult,
    NotificationChannel, QueuedJob,
};
use nf_config::AppConfig;
use nf_store::{MessageLogStore, UpdateOutcome};

use crate::adapter::ChannelAdapter;
use crate::credentials::CredentialResolver;
use crate::retry::RetryPolicy;

type SiteRateLimiter = RateLimiter<Uuid, DefaultKeyedStateStore<Uuid>, DefaultClock>;

/// What to do with the bus message after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Nack { delay_seconds: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct ChannelWorkerConfig {
    pub channel: NotificationChannel,
    pub concurrency: u32,
    pub poll_batch_size: u32,
    pub poll_interval: Duration,
    /// Hard deadline per adapter call; exceeding it classifies as TRANSIENT
    pub adapter_timeout: Duration,
    /// Drain window before abandoning in-flight work at shutdown
    pub drain_grace: Duration,
    /// Per-site delivery rate cap for pool fairness
    pub site_rate_limit_per_minute: Option<u32>,
}

impl ChannelWorkerConfig {
    pub fn from_app_config(channel: NotificationChannel, config: &AppConfig) -> Self {
        Self {
            channel,
            concurrency: config.worker.concurrency,
            poll_batch_size: config.worker.poll_batch_size,
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            adapter_timeout: Duration::from_millis(config.adapter.for_channel(channel).timeout_ms),
            drain_grace: Duration::from_secs(config.worker.drain_grace_secs),
            site_rate_limit_per_minute: config.worker.site_rate_limit_per_minute,
        }
    }
}

/// Worker pool for one channel topic.
///
/// Inside the pool, per-message processing is sequential; across messages it
/// is parallel, bounded by the semaphore. Per-site ordering is preserved by
/// the bus partitioning; a keyed rate limiter keeps one noisy tenant from
/// monopolizing the pool.
pub struct ChannelWorker {
    config: ChannelWorkerConfig,
    store: Arc<dyn MessageLogStore>,
    credentials: Arc<CredentialResolver>,
    adapter: Arc<dyn ChannelAdapter>,
    consumer: Arc<dyn BusConsumer>,
    publisher: Arc<dyn BusPublisher>,
    dlq: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    site_limiter: Option<Arc<SiteRateLimiter>>,
    running: AtomicBool,
    in_flight: AtomicU32,
}

impl ChannelWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelWorkerConfig,
        store: Arc<dyn MessageLogStore>,
        credentials: Arc<CredentialResolver>,
        adapter: Arc<dyn ChannelAdapter>,
        consumer: Arc<dyn BusConsumer>,
        publisher: Arc<dyn BusPublisher>,
        dlq: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
    ) -> Self {
        let site_limiter = config.site_rate_limit_per_minute.and_then(|rpm| {
            NonZeroU32::new(rpm).map(|nz| Arc::new(RateLimiter::keyed(Quota::per_minute(nz))))
        });

        let concurrency = config.concurrency.max(1);

        Self {
            config,
            store,
            credentials,
            adapter,
            consumer,
            publisher,
            dlq,
            retry,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            site_limiter,
            running: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Start the poll loop. Returns the task handle.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = self;
        tokio::spawn(async move {
            info!(
                channel = %worker.config.channel,
                concurrency = worker.config.concurrency,
                topic = worker.consumer.identifier(),
                "Channel worker started"
            );

            let mut interval = tokio::time::interval(worker.config.poll_interval);
            while worker.running.load(Ordering::SeqCst) {
                interval.tick().await;

                let jobs = match worker.consumer.poll(worker.config.poll_batch_size).await {
                    Ok(jobs) => jobs,
                    Err(BusError::Stopped) => break,
                    Err(e) => {
                        warn!(channel = %worker.config.channel, error = %e, "Bus poll failed");
                        continue;
                    }
                };

                for queued in jobs {
                    // Per-site fairness: push a rate-limited site's job back
                    // without counting it as a failure.
                    if let Some(ref limiter) = worker.site_limiter {
                        if limiter.check_key(&queued.job.site_id).is_err() {
                            debug!(
                                site_id = %queued.job.site_id,
                                message_id = %queued.job.message_id,
                                "Site rate limited, deferring"
                            );
                            metrics::counter!(
                                "worker.deferred_total",
                                "channel" => worker.config.channel.as_str()
                            )
                            .increment(1);
                            let _ = worker.consumer.nack(&queued.receipt_handle, Some(1)).await;
                            continue;
                        }
                    }

                    let permit = match worker.semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            error!("Worker semaphore closed");
                            let _ = worker.consumer.nack(&queued.receipt_handle, Some(5)).await;
                            break;
                        }
                    };

                    worker.in_flight.fetch_add(1, Ordering::SeqCst);
                    let w = Arc::clone(&worker);
                    tokio::spawn(async move {
                        w.handle(queued).await;
                        w.in_flight.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
            }

            info!(channel = %worker.config.channel, "Channel worker poll loop exited");
        })
    }

    /// Process one queued job end to end, then settle the bus message.
    /// Everything runs inside the delivery span so nested log lines carry
    /// the tenant and message identity.
    pub async fn handle(&self, queued: QueuedJob) {
        let span = delivery_span(
            queued.job.site_id,
            &queued.job.message_id,
            queued.job.channel,
            queued.job.attempt,
        );

        async {
            let disposition = self.process(&queued.job).await;

            match disposition {
                Disposition::Ack => {
                    if let Err(e) = self.consumer.ack(&queued.receipt_handle).await {
                        warn!(
                            message_id = %queued.job.message_id,
                            error = %e,
                            "ACK failed, redelivery will be absorbed by idempotent ignore"
                        );
                    }
                }
                Disposition::Nack { delay_seconds } => {
                    if let Err(e) = self.consumer.nack(&queued.receipt_handle, delay_seconds).await
                    {
                        warn!(message_id = %queued.job.message_id, error = %e, "NACK failed");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, job: &DeliveryJob) -> Disposition {
        // 1. Hydrate; absent or terminal rows are acked away (idempotent ignore)
        let row = match self.store.find(job.site_id, &job.message_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!(message_id = %job.message_id, "No message log row, ignoring job");
                return Disposition::Ack;
            }
            Err(e) => {
                warn!(message_id = %job.message_id, error = %e, "Message log unavailable");
                return Disposition::Nack { delay_seconds: Some(5) };
            }
        };

        if row.status.is_terminal() {
            debug!(
                message_id = %job.message_id,
                status = %row.status,
                "Row already terminal, ignoring job"
            );
            return Disposition::Ack;
        }

        // A SENT row means a previous attempt committed but its ack was lost;
        // redelivery must not send again.
        if !matches!(row.status, DeliveryStatus::Pending | DeliveryStatus::Retrying) {
            debug!(
                message_id = %job.message_id,
                status = %row.status,
                "Row not in a processable state, ignoring job"
            );
            return Disposition::Ack;
        }

        // Stale redelivery of an attempt whose failure is already recorded
        if job.attempt <= row.retry_count as u32 {
            debug!(
                message_id = %job.message_id,
                attempt = job.attempt,
                retry_count = row.retry_count,
                "Attempt already settled, ignoring redelivery"
            );
            return Disposition::Ack;
        }

        // 2. Resolve credentials lazily; missing with no default is permanent
        let credentials = match self
            .credentials
            .resolve(job.site_id, self.config.channel)
            .await
        {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                return self
                    .settle_failure(
                        job,
                        FailureClassification::Permanent,
                        Some("CREDENTIALS_MISSING".to_string()),
                        "no channel credentials for site and no platform default".to_string(),
                        None,
                    )
                    .await;
            }
            Err(e) => {
                warn!(message_id = %job.message_id, error = %e, "Credential lookup failed");
                return Disposition::Nack { delay_seconds: Some(5) };
            }
        };

        // 3. Adapter call under the channel deadline
        let request = row.normalized_request();
        let result = match tokio::time::timeout(
            self.config.adapter_timeout,
            self.adapter.send(&credentials, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => NormalizedResult::failure(
                FailureClassification::Transient,
                Some("DEADLINE".to_string()),
                format!(
                    "adapter deadline of {}ms exceeded",
                    self.config.adapter_timeout.as_millis()
                ),
            ),
        };

        match result {
            NormalizedResult::Accepted => self.settle_success(job, false).await,
            NormalizedResult::Delivered => self.settle_success(job, true).await,
            NormalizedResult::Failure {
                classification,
                code,
                message,
                retry_after,
            } => {
                self.settle_failure(job, classification, code, message, retry_after)
                    .await
            }
        }
    }

    /// 4. Success path: SENT, then DELIVERED when the adapter confirmed
    /// synchronous delivery. Both transitions are audited.
    async fn settle_success(&self, job: &DeliveryJob, delivered: bool) -> Disposition {
        let outcome = match self
            .store
            .update_status(
                job.site_id,
                &job.message_id,
                DeliveryStatus::Sent,
                None,
                None,
                HistorySource::Api,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(message_id = %job.message_id, error = %e, "Status update failed");
                return Disposition::Nack { delay_seconds: Some(5) };
            }
        };

        if !outcome.is_applied() {
            // A concurrent writer moved the row; the audit already has our attempt
            return Disposition::Ack;
        }

        if delivered {
            match self
                .store
                .update_status(
                    job.site_id,
                    &job.message_id,
                    DeliveryStatus::Delivered,
                    None,
                    None,
                    HistorySource::Api,
                )
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    // SENT is already durable; the delivery confirmation will
                    // come again via redelivery or a provider callback
                    warn!(message_id = %job.message_id, error = %e, "DELIVERED update failed");
                }
            }
        }

        metrics::counter!(
            "worker.deliveries_total",
            "channel" => self.config.channel.as_str(),
            "outcome" => if delivered { "delivered" } else { "sent" }
        )
        .increment(1);

        debug!(
            message_id = %job.message_id,
            attempt = job.attempt,
            delivered = delivered,
            "Delivery succeeded"
        );
        Disposition::Ack
    }

    /// 5. Failure path: classify, consult the retry policy, and either
    /// schedule a re-delivery or finish terminally. A provider-supplied
    /// Retry-After is handed to the policy as the delay floor.
    async fn settle_failure(
        &self,
        job: &DeliveryJob,
        classification: FailureClassification,
        code: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    ) -> Disposition {
        let error_text = match code {
            Some(ref c) => format!("[{}] {}", c, message),
            None => message.clone(),
        };

        if self
            .retry
            .allows_retry(classification, self.config.channel, job.attempt)
        {
            let Some(delay) = self
                .retry
                .next_delay(classification, job.attempt, retry_after)
            else {
                return self.settle_terminal(job, classification, &error_text).await;
            };

            // Publish the next attempt before flipping the status; a crash
            // in between redelivers this attempt, which the stale guard and
            // the bus dedup both tolerate.
            let next = job.next_attempt();
            if let Err(e) = self.publisher.publish_delayed(&next, delay).await {
                warn!(
                    message_id = %job.message_id,
                    error = %e,
                    "Re-enqueue failed, leaving attempt for redelivery"
                );
                return Disposition::Nack { delay_seconds: Some(5) };
            }

            match self
                .store
                .update_status(
                    job.site_id,
                    &job.message_id,
                    DeliveryStatus::Retrying,
                    Some(&error_text),
                    Some(job.attempt as i32),
                    HistorySource::Api,
                )
                .await
            {
                Ok(_) => {
                    metrics::counter!(
                        "worker.retries_scheduled_total",
                        "channel" => self.config.channel.as_str(),
                        "classification" => classification.as_str()
                    )
                    .increment(1);

                    info!(
                        message_id = %job.message_id,
                        attempt = job.attempt,
                        classification = classification.as_str(),
                        delay_ms = delay.as_millis(),
                        "Retry scheduled"
                    );
                    Disposition::Ack
                }
                Err(e) => {
                    warn!(message_id = %job.message_id, error = %e, "RETRYING update failed");
                    Disposition::Nack { delay_seconds: Some(5) }
                }
            }
        } else {
            self.settle_terminal(job, classification, &error_text).await
        }
    }

    /// Terminal failure: FAILED status; the attempt ceiling additionally
    /// parks the job on the DLQ with its last classification. AUTH and
    /// PERMANENT leave retry_count untouched.
    async fn settle_terminal(
        &self,
        job: &DeliveryJob,
        classification: FailureClassification,
        error_text: &str,
    ) -> Disposition {
        let retry_count = if classification.is_retryable() {
            Some(job.attempt as i32)
        } else {
            None
        };

        match self
            .store
            .update_status(
                job.site_id,
                &job.message_id,
                DeliveryStatus::Failed,
                Some(error_text),
                retry_count,
                HistorySource::Api,
            )
            .await
        {
            Ok(UpdateOutcome::Applied(_)) => {
                if classification.is_retryable() {
                    // Attempt ceiling reached
                    let dead = DeadLetter::new(
                        job.clone(),
                        error_text.to_string(),
                        Some(classification),
                    );
                    if let Err(e) = self.dlq.publish_dead_letter(&dead).await {
                        warn!(message_id = %job.message_id, error = %e, "DLQ publish failed");
                    }
                    metrics::counter!(
                        "worker.dead_lettered_total",
                        "channel" => self.config.channel.as_str()
                    )
                    .increment(1);
                }

                metrics::counter!(
                    "worker.failures_total",
                    "channel" => self.config.channel.as_str(),
                    "classification" => classification.as_str()
                )
                .increment(1);

                warn!(
                    message_id = %job.message_id,
                    attempt = job.attempt,
                    classification = classification.as_str(),
                    error = %error_text,
                    "Delivery failed terminally"
                );
                Disposition::Ack
            }
            Ok(UpdateOutcome::InvalidTransition { .. }) => Disposition::Ack,
            Err(e) => {
                warn!(message_id = %job.message_id, error = %e, "FAILED update failed");
                Disposition::Nack { delay_seconds: Some(5) }
            }
        }
    }

    /// Stop polling and drain: in-flight work either completes and acks
    /// within the grace window, or is abandoned for redelivery.
    pub async fn shutdown(&self) {
        info!(channel = %self.config.channel, "Draining channel worker");
        self.running.store(false, Ordering::SeqCst);
        self.consumer.stop().await;

        let deadline = Instant::now() + self.config.drain_grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(
                channel = %self.config.channel,
                remaining = remaining,
                "Drain grace expired, abandoning in-flight work for redelivery"
            );
        } else {
            info!(channel = %self.config.channel, "Channel worker drained");
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}
