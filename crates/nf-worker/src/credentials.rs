//! Tenant Credential Resolver
//!
//! Credentials are fetched lazily at send time, never embedded in bus
//! payloads. Resolutions are cached per (site, channel) for a short TTL so
//! per-message lookups are avoided while key rotation still lands within
//! seconds.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use nf_common::{NotificationChannel, SiteCredentials};
use nf_config::TenantDefaults;
use nf_store::{Result, TenantConfigStore};

struct CacheEntry {
    resolved_at: Instant,
    credentials: Option<SiteCredentials>,
}

pub struct CredentialResolver {
    store: Arc<dyn TenantConfigStore>,
    defaults: TenantDefaults,
    ttl: Duration,
    cache: DashMap<(Uuid, NotificationChannel), CacheEntry>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn TenantConfigStore>, defaults: TenantDefaults, ttl: Duration) -> Self {
        Self {
            store,
            defaults,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Resolve credentials for (site, channel).
    ///
    /// Returns None when the tenant has no channel config and no platform
    /// default applies - the caller classifies that as PERMANENT.
    pub async fn resolve(
        &self,
        site_id: Uuid,
        channel: NotificationChannel,
    ) -> Result<Option<SiteCredentials>> {
        let key = (site_id, channel);

        if let Some(entry) = self.cache.get(&key) {
            if entry.resolved_at.elapsed() < self.ttl {
                return Ok(entry.credentials.clone());
            }
        }

        let credentials = match self.store.channel_config(site_id, channel).await? {
            Some(config) => Some(config.credentials()),
            None => self.platform_default(channel),
        };

        self.cache.insert(
            key,
            CacheEntry {
                resolved_at: Instant::now(),
                credentials: credentials.clone(),
            },
        );

        debug!(
            site_id = %site_id,
            channel = %channel,
            resolved = credentials.is_some(),
            "Credentials resolved"
        );
        Ok(credentials)
    }

    /// Drop a cached resolution, forcing a fresh lookup on next use.
    pub fn invalidate(&self, site_id: Uuid, channel: NotificationChannel) {
        self.cache.remove(&(site_id, channel));
    }

    fn platform_default(&self, channel: NotificationChannel) -> Option<SiteCredentials> {
        let defaults = self.defaults.for_channel(channel);
        if defaults.api_key.is_empty() {
            return None;
        }
        Some(SiteCredentials {
            api_key: Some(defaults.api_key.clone()),
            from_address: (!defaults.from_address.is_empty())
                .then(|| defaults.from_address.clone()),
            session_name: (!defaults.session_name.is_empty())
                .then(|| defaults.session_name.clone()),
            endpoint: None,
            signing_secret: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nf_common::AuditStamps;
    use nf_store::TenantChannelConfig;
    use parking_lot::Mutex;

    struct CountingStore {
        lookups: Mutex<u32>,
        config: Mutex<Option<TenantChannelConfig>>,
    }

    impl CountingStore {
        fn new(config: Option<TenantChannelConfig>) -> Self {
            Self {
                lookups: Mutex::new(0),
                config: Mutex::new(config),
            }
        }
    }

    #[async_trait]
    impl TenantConfigStore for CountingStore {
        async fn upsert(&self, config: &TenantChannelConfig) -> Result<()> {
            *self.config.lock() = Some(config.clone());
            Ok(())
        }

        async fn channel_config(
            &self,
            _site_id: Uuid,
            _channel: NotificationChannel,
        ) -> Result<Option<TenantChannelConfig>> {
            *self.lookups.lock() += 1;
            Ok(self.config.lock().clone())
        }
    }

    fn site_config(site_id: Uuid, api_key: &str) -> TenantChannelConfig {
        TenantChannelConfig {
            site_id,
            channel: NotificationChannel::Email,
            api_key: Some(api_key.to_string()),
            from_address: None,
            session_name: None,
            endpoint: None,
            signing_secret: None,
            audit: AuditStamps::now(),
        }
    }

    #[tokio::test]
    async fn test_resolution_is_cached_within_ttl() {
        let site = Uuid::new_v4();
        let store = Arc::new(CountingStore::new(Some(site_config(site, "key-1"))));
        let resolver = CredentialResolver::new(
            store.clone(),
            TenantDefaults::default(),
            Duration::from_secs(60),
        );

        let first = resolver
            .resolve(site, NotificationChannel::Email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.api_key.as_deref(), Some("key-1"));

        resolver
            .resolve(site, NotificationChannel::Email)
            .await
            .unwrap();
        assert_eq!(*store.lookups.lock(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_fresh_lookup() {
        let site = Uuid::new_v4();
        let store = Arc::new(CountingStore::new(Some(site_config(site, "key-1"))));
        let resolver = CredentialResolver::new(
            store.clone(),
            TenantDefaults::default(),
            Duration::from_secs(60),
        );

        resolver
            .resolve(site, NotificationChannel::Email)
            .await
            .unwrap();
        store.upsert(&site_config(site, "key-2")).await.unwrap();
        resolver.invalidate(site, NotificationChannel::Email);

        let fresh = resolver
            .resolve(site, NotificationChannel::Email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.api_key.as_deref(), Some("key-2"));
        assert_eq!(*store.lookups.lock(), 2);
    }

    #[tokio::test]
    async fn test_missing_config_falls_back_to_platform_default() {
        let site = Uuid::new_v4();
        let store = Arc::new(CountingStore::new(None));

        let mut defaults = TenantDefaults::default();
        defaults.email.api_key = "platform-key".to_string();
        defaults.email.from_address = "noreply@platform.io".to_string();

        let resolver = CredentialResolver::new(store, defaults, Duration::from_secs(60));

        let creds = resolver
            .resolve(site, NotificationChannel::Email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.api_key.as_deref(), Some("platform-key"));
        assert_eq!(creds.from_address.as_deref(), Some("noreply@platform.io"));
    }

    #[tokio::test]
    async fn test_no_config_and_no_default_is_none() {
        let site = Uuid::new_v4();
        let store = Arc::new(CountingStore::new(None));
        let resolver =
            CredentialResolver::new(store, TenantDefaults::default(), Duration::from_secs(60));

        let creds = resolver
            .resolve(site, NotificationChannel::Sms)
            .await
            .unwrap();
        assert!(creds.is_none());
    }
}
