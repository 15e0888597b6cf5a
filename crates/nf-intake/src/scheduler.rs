//! Scheduled Promotion Loop
//!
//! Periodically claims due SCHEDULED messages, promotes them to PENDING, and
//! publishes their first delivery attempt. The claim is an atomic
//! claim-and-promote in the store, so concurrently running shards cannot
//! double-promote. A failed publish reverts the row to SCHEDULED - PENDING
//! never exists without an enqueued job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use nf_bus::BusPublisher;
use nf_common::{DeliveryJob, NotificationChannel};
use nf_store::MessageLogStore;

use crate::Result;

#[derive(Debug, Clone)]
pub struct SchedulerLoopConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
    pub batch_size: u32,
}

impl SchedulerLoopConfig {
    pub fn from_app_config(config: &nf_config::SchedulerConfig) -> Self {
        Self {
            enabled: config.enabled,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            batch_size: config.batch_size,
        }
    }
}

pub struct SchedulerLoop {
    config: SchedulerLoopConfig,
    store: Arc<dyn MessageLogStore>,
    publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>>,
    running: Arc<RwLock<bool>>,
}

impl SchedulerLoop {
    pub fn new(
        config: SchedulerLoopConfig,
        store: Arc<dyn MessageLogStore>,
        publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>>,
    ) -> Self {
        Self {
            config,
            store,
            publishers,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Scheduler loop is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Scheduler loop already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            tick_interval_ms = self.config.tick_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Starting scheduler loop"
        );

        let scheduler = self;
        tokio::spawn(async move {
            let mut interval = interval(scheduler.config.tick_interval);
            loop {
                interval.tick().await;
                if !*scheduler.running.read().await {
                    break;
                }
                if let Err(e) = scheduler.tick().await {
                    error!(error = %e, "Scheduler tick failed");
                }
            }
            info!("Scheduler loop exited");
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Scheduler loop stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// One promotion pass. Exposed for tests and manual draining.
    pub async fn tick(&self) -> Result<usize> {
        let claimed = self
            .store
            .claim_due_scheduled(Utc::now(), self.config.batch_size)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(count = claimed.len(), "Promoting due scheduled messages");
        metrics::gauge!("scheduler.due_claimed").set(claimed.len() as f64);

        let mut promoted = 0usize;
        for row in claimed {
            let job = DeliveryJob::first_attempt(&row.message_id, row.site_id, row.channel);

            let Some(publisher) = self.publishers.get(&row.channel) else {
                warn!(
                    message_id = %row.message_id,
                    channel = %row.channel,
                    "No publisher for channel, reverting to SCHEDULED"
                );
                self.revert(row.site_id, &row.message_id).await;
                continue;
            };

            match publisher.publish(&job).await {
                Ok(_) => {
                    promoted += 1;
                    debug!(
                        message_id = %row.message_id,
                        site_id = %row.site_id,
                        "Scheduled message promoted and enqueued"
                    );
                    metrics::counter!("scheduler.promoted_total").increment(1);
                }
                Err(e) => {
                    // PENDING without an enqueued job must not survive
                    warn!(
                        message_id = %row.message_id,
                        error = %e,
                        "Publish failed, reverting promotion"
                    );
                    metrics::counter!("scheduler.publish_errors_total").increment(1);
                    self.revert(row.site_id, &row.message_id).await;
                }
            }
        }

        Ok(promoted)
    }

    async fn revert(&self, site_id: uuid::Uuid, message_id: &str) {
        if let Err(e) = self.store.revert_to_scheduled(site_id, message_id).await {
            // The row stays PENDING; the next tick cannot re-claim it, so
            // surface loudly for the operator
            error!(
                site_id = %site_id,
                message_id = %message_id,
                error = %e,
                "Failed to revert promotion"
            );
        }
    }
}
