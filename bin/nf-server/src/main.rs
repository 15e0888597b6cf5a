//! NotifyFabric Server
//!
//! All-in-one deployment: REST API, scheduled-promotion loop, and one worker
//! pool per notification channel over the embedded bus. Production setups
//! point the store at Postgres; the embedded SQLite store and bus cover
//! development and single-node installs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Json};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa_swagger_ui::SwaggerUi;

use nf_api::{build_router, ApiState, AuthState};
use nf_bus::{BusConsumer, BusPublisher, DeadLetterSink, EmbeddedBus, SqliteBus};
use nf_common::NotificationChannel;
use nf_config::AppConfig;
use nf_intake::scheduler::SchedulerLoopConfig;
use nf_intake::{IntakeService, SchedulerLoop};
use nf_store::{
    MessageLogStore, PostgresMessageLogStore, SqliteMessageLogStore, TenantConfigStore,
};
use nf_worker::{
    ChannelWorker, ChannelWorkerConfig, CredentialResolver, HttpAdapterConfig,
    HttpProviderAdapter, RetryPolicy,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    nf_common::logging::init_logging("nf-server");

    info!("Starting NotifyFabric server");

    let config = AppConfig::load()?;
    info!(
        http_port = config.http.port,
        database = %config.database.url,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    // Prometheus exporter; the handle renders /metrics
    let prometheus = PrometheusBuilder::new().install_recorder()?;

    // Message log store: postgres in production, sqlite embedded
    let (store, tenant_store) = open_store(&config).await?;
    store.init_schema().await?;

    // Embedded bus: one topic per channel plus its DLQ
    if let Some(dir) = sqlite_data_dir(&config.bus.url) {
        std::fs::create_dir_all(dir)?;
    }
    let bus_pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.bus.url)
        .await?;

    let mut buses: HashMap<NotificationChannel, Arc<SqliteBus>> = HashMap::new();
    for channel in NotificationChannel::ALL {
        let bus = Arc::new(SqliteBus::new(
            bus_pool.clone(),
            config.bus.topics.for_channel(channel).to_string(),
            Some(config.bus.dlq.for_channel(channel).to_string()),
            config.bus.visibility_timeout_secs,
        ));
        bus.init_schema().await?;
        buses.insert(channel, bus);
    }

    // Intake over per-channel publishers
    let publishers: HashMap<NotificationChannel, Arc<dyn BusPublisher>> = buses
        .iter()
        .map(|(channel, bus)| (*channel, bus.clone() as Arc<dyn BusPublisher>))
        .collect();
    let intake = Arc::new(IntakeService::new(store.clone(), publishers.clone()));

    // Scheduler promotion loop
    let scheduler = Arc::new(SchedulerLoop::new(
        SchedulerLoopConfig::from_app_config(&config.scheduler),
        store.clone(),
        publishers,
    ));
    scheduler.clone().start().await;

    // Channel workers
    let resolver = Arc::new(CredentialResolver::new(
        tenant_store,
        config.tenant.defaults.clone(),
        Duration::from_secs(config.tenant.credential_ttl_secs.max(1)),
    ));
    let retry = RetryPolicy::from_config(&config.retry);

    let mut workers: Vec<Arc<ChannelWorker>> = Vec::new();
    for channel in NotificationChannel::ALL {
        let bus = buses.get(&channel).expect("bus per channel");
        let adapter_config = config.adapter.for_channel(channel);

        let adapter = Arc::new(HttpProviderAdapter::new(
            channel,
            HttpAdapterConfig {
                endpoint: adapter_config.endpoint.clone(),
                timeout: Duration::from_millis(adapter_config.timeout_ms),
                connect_timeout: Duration::from_secs(5),
            },
        ));

        let worker = Arc::new(ChannelWorker::new(
            ChannelWorkerConfig::from_app_config(channel, &config),
            store.clone(),
            resolver.clone(),
            adapter,
            bus.clone() as Arc<dyn BusConsumer>,
            bus.clone() as Arc<dyn BusPublisher>,
            bus.clone() as Arc<dyn DeadLetterSink>,
            retry.clone(),
        ));
        worker.clone().start();
        workers.push(worker);
    }

    // HTTP surface
    let auth_state = AuthState::from_config(&config.auth);
    let (api_router, openapi) = build_router(ApiState { intake }, auth_state);

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    let scheduler_health = scheduler.clone();
    let app = api_router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .route(
            "/q/health",
            get(move || {
                let scheduler = scheduler_health.clone();
                async move {
                    let running = scheduler.is_running().await;
                    Json(serde_json::json!({
                        "status": "UP",
                        "scheduler_running": running,
                    }))
                }
            }),
        )
        .route(
            "/q/health/live",
            get(|| async { Json(serde_json::json!({"status": "UP"})) }),
        )
        .route(
            "/q/health/ready",
            get(|| async { Json(serde_json::json!({"status": "UP"})) }),
        )
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((config.http.host.parse::<std::net::IpAddr>()?, config.http.port));
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler, workers))
        .await?;

    info!("NotifyFabric server stopped");
    Ok(())
}

/// Open the message log store for the configured database URL.
async fn open_store(
    config: &AppConfig,
) -> Result<(Arc<dyn MessageLogStore>, Arc<dyn TenantConfigStore>)> {
    if config.database.url.starts_with("postgres") {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;
        let store = Arc::new(PostgresMessageLogStore::new(pool));
        info!("Connected to Postgres message log");
        Ok((
            store.clone() as Arc<dyn MessageLogStore>,
            store as Arc<dyn TenantConfigStore>,
        ))
    } else {
        if let Some(dir) = sqlite_data_dir(&config.database.url) {
            std::fs::create_dir_all(dir)?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;
        let store = Arc::new(SqliteMessageLogStore::new(pool));
        info!("Opened embedded SQLite message log");
        Ok((
            store.clone() as Arc<dyn MessageLogStore>,
            store as Arc<dyn TenantConfigStore>,
        ))
    }
}

/// Parent directory for a file-backed sqlite URL, if any.
fn sqlite_data_dir(url: &str) -> Option<std::path::PathBuf> {
    let path = url.strip_prefix("sqlite://")?;
    let path = path.split('?').next()?;
    if path.starts_with(":memory:") {
        return None;
    }
    std::path::Path::new(path).parent().map(|p| p.to_path_buf())
}

async fn shutdown_signal(scheduler: Arc<SchedulerLoop>, workers: Vec<Arc<ChannelWorker>>) {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to install CTRL+C handler");
        return;
    }
    info!("Shutdown signal received");

    scheduler.stop().await;
    for worker in &workers {
        worker.shutdown().await;
    }
}
