//! NotifyFabric Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use nf_common::NotificationChannel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub adapter: AdapterConfig,
    pub scheduler: SchedulerConfig,
    pub tenant: TenantConfig,
    pub auth: AuthConfig,

    /// Enable development mode (seeded API keys, relaxed checks)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            bus: BusConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            adapter: AdapterConfig::default(),
            scheduler: SchedulerConfig::default(),
            tenant: TenantConfig::default(),
            auth: AuthConfig::default(),
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load with the standard search paths and env overrides
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 || self.scheduler.tick_interval_ms > 1000 {
            return Err(ConfigError::ValidationError(
                "scheduler.tick_interval_ms must be in 1..=1000".to_string(),
            ));
        }
        for channel in NotificationChannel::ALL {
            if self.retry.max_attempts.for_channel(channel) == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "retry.max_attempts.{} must be at least 1",
                    channel.as_str().to_lowercase()
                )));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

/// Message log database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL; sqlite for embedded mode, postgres for production
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/notifyfabric.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

/// Dispatch bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// sqlx connection URL for the embedded bus store
    pub url: String,
    pub visibility_timeout_secs: u32,
    pub topics: TopicNames,
    pub dlq: TopicNames,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/notifyfabric-bus.db?mode=rwc".to_string(),
            visibility_timeout_secs: 120,
            topics: TopicNames::delivery(),
            dlq: TopicNames::dlq(),
        }
    }
}

/// Per-channel topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicNames {
    pub email: String,
    pub whatsapp: String,
    pub sms: String,
    pub push: String,
}

impl TopicNames {
    fn delivery() -> Self {
        Self {
            email: "notif.email".to_string(),
            whatsapp: "notif.whatsapp".to_string(),
            sms: "notif.sms".to_string(),
            push: "notif.push".to_string(),
        }
    }

    fn dlq() -> Self {
        Self {
            email: "notif.email.dlq".to_string(),
            whatsapp: "notif.whatsapp.dlq".to_string(),
            sms: "notif.sms.dlq".to_string(),
            push: "notif.push.dlq".to_string(),
        }
    }

    pub fn for_channel(&self, channel: NotificationChannel) -> &str {
        match channel {
            NotificationChannel::Email => &self.email,
            NotificationChannel::Whatsapp => &self.whatsapp,
            NotificationChannel::Sms => &self.sms,
            NotificationChannel::Push => &self.push,
        }
    }
}

impl Default for TopicNames {
    fn default() -> Self {
        Self::delivery()
    }
}

/// Channel worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parallel deliveries per channel pool
    pub concurrency: u32,
    /// Messages fetched per bus poll
    pub poll_batch_size: u32,
    pub poll_interval_ms: u64,
    /// Drain window before the consumer stops at shutdown
    pub drain_grace_secs: u64,
    /// Per-site delivery rate cap; None disables fairness limiting
    pub site_rate_limit_per_minute: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_batch_size: 10,
            poll_interval_ms: 250,
            drain_grace_secs: 30,
            site_rate_limit_per_minute: Some(600),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: MaxAttempts,
    /// Base delay for TRANSIENT backoff
    pub backoff_base_ms: u64,
    /// Cap for TRANSIENT backoff
    pub backoff_cap_ms: u64,
    /// Base delay for RATE_LIMIT exponential backoff
    pub rate_limit_base_ms: u64,
    /// Cap for RATE_LIMIT exponential backoff
    pub rate_limit_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::default(),
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            rate_limit_base_ms: 2_000,
            rate_limit_cap_ms: 900_000,
        }
    }
}

/// Per-channel attempt ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxAttempts {
    pub email: u32,
    pub whatsapp: u32,
    pub sms: u32,
    pub push: u32,
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self {
            email: 5,
            whatsapp: 5,
            sms: 5,
            push: 5,
        }
    }
}

impl MaxAttempts {
    pub fn for_channel(&self, channel: NotificationChannel) -> u32 {
        match channel {
            NotificationChannel::Email => self.email,
            NotificationChannel::Whatsapp => self.whatsapp,
            NotificationChannel::Sms => self.sms,
            NotificationChannel::Push => self.push,
        }
    }
}

/// Channel adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub email: ChannelAdapterConfig,
    pub whatsapp: ChannelAdapterConfig,
    pub sms: ChannelAdapterConfig,
    pub push: ChannelAdapterConfig,
}

impl AdapterConfig {
    pub fn for_channel(&self, channel: NotificationChannel) -> &ChannelAdapterConfig {
        match channel {
            NotificationChannel::Email => &self.email,
            NotificationChannel::Whatsapp => &self.whatsapp,
            NotificationChannel::Sms => &self.sms,
            NotificationChannel::Push => &self.push,
        }
    }
}

/// Single channel adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelAdapterConfig {
    /// Platform-level provider endpoint for this channel
    pub endpoint: String,
    /// Hard deadline per adapter call
    pub timeout_ms: u64,
}

impl Default for ChannelAdapterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_ms: 10_000,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Promotion tick; must be <= 1000ms
    pub tick_interval_ms: u64,
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 500,
            batch_size: 100,
        }
    }
}

/// Platform-wide tenant defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub defaults: TenantDefaults,
    /// Credential cache TTL in the worker's resolver
    pub credential_ttl_secs: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            defaults: TenantDefaults::default(),
            credential_ttl_secs: 60,
        }
    }
}

/// Fallback credentials used when a tenant has no channel config of its own
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantDefaults {
    pub email: ChannelDefaults,
    pub whatsapp: ChannelDefaults,
    pub sms: ChannelDefaults,
    pub push: ChannelDefaults,
}

impl TenantDefaults {
    pub fn for_channel(&self, channel: NotificationChannel) -> &ChannelDefaults {
        match channel {
            NotificationChannel::Email => &self.email,
            NotificationChannel::Whatsapp => &self.whatsapp,
            NotificationChannel::Sms => &self.sms,
            NotificationChannel::Push => &self.push,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    pub api_key: String,
    pub from_address: String,
    pub session_name: String,
}

/// API authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Platform admin key for the X-NF-Admin-Key header
    pub admin_key: String,
    /// Statically provisioned site API keys (dev/embedded mode)
    pub api_keys: Vec<SiteApiKey>,
}

/// One provisioned API key bound to a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteApiKey {
    pub key: String,
    pub site_id: Uuid,
}
