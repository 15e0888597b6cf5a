//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "notifyfabric.toml",
    "./config/config.toml",
    "./config/notifyfabric.toml",
    "/etc/notifyfabric/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check NOTIFYFABRIC_CONFIG env var
        if let Ok(path) = env::var("NOTIFYFABRIC_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("NOTIFYFABRIC_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Database
        if let Ok(val) = env::var("NOTIFYFABRIC_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.database.max_connections = max;
            }
        }

        // Bus
        if let Ok(val) = env::var("NOTIFYFABRIC_BUS_URL") {
            config.bus.url = val;
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_BUS_VISIBILITY_TIMEOUT") {
            if let Ok(timeout) = val.parse() {
                config.bus.visibility_timeout_secs = timeout;
            }
        }

        // Worker
        if let Ok(val) = env::var("NOTIFYFABRIC_WORKER_CONCURRENCY") {
            if let Ok(concurrency) = val.parse() {
                config.worker.concurrency = concurrency;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_WORKER_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.worker.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_WORKER_DRAIN_GRACE_SECS") {
            if let Ok(grace) = val.parse() {
                config.worker.drain_grace_secs = grace;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_WORKER_SITE_RATE_LIMIT") {
            config.worker.site_rate_limit_per_minute = val.parse().ok();
        }

        // Retry
        if let Ok(val) = env::var("NOTIFYFABRIC_RETRY_BACKOFF_BASE_MS") {
            if let Ok(base) = val.parse() {
                config.retry.backoff_base_ms = base;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_RETRY_BACKOFF_CAP_MS") {
            if let Ok(cap) = val.parse() {
                config.retry.backoff_cap_ms = cap;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_RETRY_RATE_LIMIT_CAP_MS") {
            if let Ok(cap) = val.parse() {
                config.retry.rate_limit_cap_ms = cap;
            }
        }

        // Scheduler
        if let Ok(val) = env::var("NOTIFYFABRIC_SCHEDULER_ENABLED") {
            config.scheduler.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_SCHEDULER_TICK_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.scheduler.tick_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("NOTIFYFABRIC_SCHEDULER_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.scheduler.batch_size = size;
            }
        }

        // Auth
        if let Ok(val) = env::var("NOTIFYFABRIC_ADMIN_KEY") {
            config.auth.admin_key = val;
        }

        // General
        if let Ok(val) = env::var("NOTIFYFABRIC_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
