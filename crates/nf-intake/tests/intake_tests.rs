//! Intake & Scheduler Integration Tests
//!
//! Covers idempotent resubmission, scheduled promotion, cancellation rules,
//! bulk partial success, and the publish-failure revert.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use nf_bus::{BusConsumer, BusPublisher, EmbeddedBus, SqliteBus};
use nf_common::{DeliveryJob, DeliveryStatus, HistorySource, NotificationChannel};
use nf_intake::{
    scheduler::SchedulerLoopConfig, BulkEntryStatus, IntakeError, IntakeService, SchedulerLoop,
};
use nf_store::{
    MessageLogStore, NotificationIntent, NotificationPayload, SqliteMessageLogStore,
};

struct TestRig {
    store: Arc<SqliteMessageLogStore>,
    bus: Arc<SqliteBus>,
    intake: IntakeService,
}

async fn build_rig() -> TestRig {
    let store_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteMessageLogStore::new(store_pool));
    store.init_schema().await.unwrap();

    let bus_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let bus = Arc::new(SqliteBus::new(
        bus_pool,
        "notif.email".to_string(),
        Some("notif.email.dlq".to_string()),
        30,
    ));
    bus.init_schema().await.unwrap();

    let mut publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>> = HashMap::new();
    publishers.insert(NotificationChannel::Email, bus.clone());

    let intake = IntakeService::new(store.clone() as Arc<dyn MessageLogStore>, publishers);

    TestRig { store, bus, intake }
}

fn email_intent(message_id: &str) -> NotificationIntent {
    NotificationIntent {
        message_id: Some(message_id.to_string()),
        channel: NotificationChannel::Email,
        recipient: "a@x.io".to_string(),
        payload: NotificationPayload {
            subject: Some("subject".to_string()),
            body: Some("body".to_string()),
            ..Default::default()
        },
        scheduled_at: None,
    }
}

#[tokio::test]
async fn test_submit_persists_and_enqueues() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let outcome = rig.intake.submit(site, &email_intent("m1")).await.unwrap();
    assert!(!outcome.replay);
    assert_eq!(outcome.row.status, DeliveryStatus::Pending);

    let jobs = rig.bus.poll(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.message_id, "m1");
    assert_eq!(jobs[0].job.site_id, site);
    assert_eq!(jobs[0].job.attempt, 1);
}

#[tokio::test]
async fn test_idempotent_resubmit_returns_stored_state() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let first = rig.intake.submit(site, &email_intent("m1")).await.unwrap();
    assert!(!first.replay);

    let second = rig.intake.submit(site, &email_intent("m1")).await.unwrap();
    assert!(second.replay);
    assert_eq!(second.row.status, first.row.status);
    assert_eq!(second.row.audit.created_at, first.row.audit.created_at);

    // One row, one job (bus dedups the replayed publish)
    let jobs = rig.bus.poll(10).await.unwrap();
    assert_eq!(jobs.len(), 1);

    let history = rig.store.history(site, "m1").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_generated_message_id_when_absent() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let mut intent = email_intent("ignored");
    intent.message_id = None;
    let outcome = rig.intake.submit(site, &intent).await.unwrap();
    assert!(!outcome.row.message_id.is_empty());
}

#[tokio::test]
async fn test_validation_failure_persists_nothing() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let mut bad = email_intent("m1");
    bad.recipient = "not-an-email".to_string();
    let err = rig.intake.submit(site, &bad).await.unwrap_err();
    assert!(matches!(err, IntakeError::Validation { .. }));

    assert!(rig.store.find(site, "m1").await.unwrap().is_none());
    assert!(rig.bus.poll(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduled_submit_requires_future() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let err = rig
        .intake
        .submit_scheduled(
            site,
            &email_intent("m1"),
            Utc::now() - chrono::Duration::seconds(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IntakeError::Validation { .. }));
}

#[tokio::test]
async fn test_scheduled_promotion_flows_to_bus() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let when = Utc::now() + chrono::Duration::milliseconds(50);
    let outcome = rig
        .intake
        .submit_scheduled(site, &email_intent("m1"), when)
        .await
        .unwrap();
    assert_eq!(outcome.row.status, DeliveryStatus::Scheduled);

    // Nothing on the bus until due
    assert!(rig.bus.poll(10).await.unwrap().is_empty());

    let mut publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>> = HashMap::new();
    publishers.insert(NotificationChannel::Email, rig.bus.clone());
    let scheduler = SchedulerLoop::new(
        SchedulerLoopConfig {
            enabled: true,
            tick_interval: Duration::from_millis(100),
            batch_size: 10,
        },
        rig.store.clone() as Arc<dyn MessageLogStore>,
        publishers,
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    let promoted = scheduler.tick().await.unwrap();
    assert_eq!(promoted, 1);

    let row = rig.store.find(site, "m1").await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);

    let jobs = rig.bus.poll(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.message_id, "m1");

    let history = rig.store.history(site, "m1").await.unwrap();
    let statuses: Vec<_> = history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![DeliveryStatus::Scheduled, DeliveryStatus::Pending]
    );

    // A second tick claims nothing
    assert_eq!(scheduler.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_publish_failure_reverts_promotion() {
    struct FailingPublisher;

    #[async_trait]
    impl BusPublisher for FailingPublisher {
        fn identifier(&self) -> &str {
            "failing"
        }

        async fn publish(&self, _job: &DeliveryJob) -> nf_bus::Result<String> {
            Err(nf_bus::BusError::Database("broker down".to_string()))
        }

        async fn publish_delayed(
            &self,
            _job: &DeliveryJob,
            _delay: Duration,
        ) -> nf_bus::Result<String> {
            Err(nf_bus::BusError::Database("broker down".to_string()))
        }
    }

    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let when = Utc::now() + chrono::Duration::milliseconds(10);
    rig.intake
        .submit_scheduled(site, &email_intent("m1"), when)
        .await
        .unwrap();

    let mut publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>> = HashMap::new();
    publishers.insert(NotificationChannel::Email, Arc::new(FailingPublisher));
    let scheduler = SchedulerLoop::new(
        SchedulerLoopConfig {
            enabled: true,
            tick_interval: Duration::from_millis(100),
            batch_size: 10,
        },
        rig.store.clone() as Arc<dyn MessageLogStore>,
        publishers,
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    let promoted = scheduler.tick().await.unwrap();
    assert_eq!(promoted, 0);

    // PENDING without an enqueued job must not survive the tick
    let row = rig.store.find(site, "m1").await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Scheduled);

    // Once the broker recovers, the message is claimable again
    let mut good: HashMap<NotificationChannel, Arc<dyn BusPublisher>> = HashMap::new();
    good.insert(NotificationChannel::Email, rig.bus.clone());
    let recovered = SchedulerLoop::new(
        SchedulerLoopConfig {
            enabled: true,
            tick_interval: Duration::from_millis(100),
            batch_size: 10,
        },
        rig.store.clone() as Arc<dyn MessageLogStore>,
        good,
    );
    assert_eq!(recovered.tick().await.unwrap(), 1);
    let row = rig.store.find(site, "m1").await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
}

#[tokio::test]
async fn test_cancel_from_pending() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    rig.intake.submit(site, &email_intent("m1")).await.unwrap();
    let row = rig.intake.cancel(site, "m1").await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Rejected);
    assert_eq!(row.last_error.as_deref(), Some("CANCELLED"));
}

#[tokio::test]
async fn test_cancel_from_scheduled() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    rig.intake
        .submit_scheduled(
            site,
            &email_intent("m1"),
            Utc::now() + chrono::Duration::seconds(600),
        )
        .await
        .unwrap();

    let row = rig.intake.cancel(site, "m1").await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Rejected);

    // A cancelled message is never promoted
    let mut publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>> = HashMap::new();
    publishers.insert(NotificationChannel::Email, rig.bus.clone());
    let scheduler = SchedulerLoop::new(
        SchedulerLoopConfig {
            enabled: true,
            tick_interval: Duration::from_millis(100),
            batch_size: 10,
        },
        rig.store.clone() as Arc<dyn MessageLogStore>,
        publishers,
    );
    assert_eq!(scheduler.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_terminal_conflicts() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    rig.intake.submit(site, &email_intent("m1")).await.unwrap();
    rig.store
        .update_status(
            site,
            "m1",
            DeliveryStatus::Failed,
            Some("boom"),
            None,
            HistorySource::Api,
        )
        .await
        .unwrap();

    let err = rig.intake.cancel(site, "m1").await.unwrap_err();
    assert!(matches!(
        err,
        IntakeError::NotCancellable {
            status: DeliveryStatus::Failed
        }
    ));
}

#[tokio::test]
async fn test_cancel_sent_conflicts() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    rig.intake.submit(site, &email_intent("m1")).await.unwrap();
    rig.store
        .update_status(site, "m1", DeliveryStatus::Sent, None, None, HistorySource::Api)
        .await
        .unwrap();

    let err = rig.intake.cancel(site, "m1").await.unwrap_err();
    assert!(matches!(err, IntakeError::NotCancellable { .. }));
}

#[tokio::test]
async fn test_cancel_unknown_is_not_found() {
    let rig = build_rig().await;
    let err = rig.intake.cancel(Uuid::new_v4(), "nope").await.unwrap_err();
    assert!(matches!(err, IntakeError::NotFound(_)));
}

#[tokio::test]
async fn test_bulk_partial_success() {
    let rig = build_rig().await;
    let site = Uuid::new_v4();

    let mut bad = email_intent("bad");
    bad.recipient = "not-an-email".to_string();

    let intents = vec![email_intent("ok-1"), bad, email_intent("ok-1")];
    let outcomes = rig.intake.submit_bulk(site, &intents, None).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].status, BulkEntryStatus::Accepted);
    assert_eq!(outcomes[1].status, BulkEntryStatus::Rejected);
    assert!(outcomes[1].error.as_ref().unwrap().contains("recipient"));
    assert_eq!(outcomes[2].status, BulkEntryStatus::Replayed);

    // Exactly one row landed
    let jobs = rig.bus.poll(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn test_history_for_foreign_site_is_not_found() {
    let rig = build_rig().await;
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    rig.intake.submit(owner, &email_intent("m1")).await.unwrap();

    let err = rig.intake.history(stranger, "m1").await.unwrap_err();
    assert!(matches!(err, IntakeError::NotFound(_)));
}
