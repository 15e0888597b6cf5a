//! Tenant Context
//!
//! Resolves and binds `site_id` from the authenticated principal. Three
//! modes: a site API key as a bearer token, the session cookie, or the
//! platform admin key paired with an explicit target site header. The admin
//! key never substitutes for tenant context - an admin request that names no
//! target site is rejected.
//!
//! `site_id` is never read from request bodies, query strings, or ordinary
//! headers; a non-admin request that tries to smuggle a target site header
//! is rejected outright.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, header::COOKIE, request::Parts},
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApiError;
use nf_config::AuthConfig;

/// Session cookie name
const SESSION_COOKIE_NAME: &str = "nf_session";
/// Platform admin key header
pub const ADMIN_KEY_HEADER: &str = "x-nf-admin-key";
/// Target tenant header, honored only alongside a valid admin key
pub const ADMIN_SITE_HEADER: &str = "x-nf-site-id";

/// How the principal authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    SiteKey,
    Session,
    Admin,
}

/// The authenticated tenant for this request.
pub struct TenantContext {
    pub site_id: Uuid,
    pub principal: Principal,
}

impl TenantContext {
    pub fn site_id(&self) -> Uuid {
        self.site_id
    }
}

/// Shared authentication state, injected via an Extension layer.
#[derive(Clone)]
pub struct AuthState {
    /// Site API keys; the same tokens back the session cookie
    site_keys: Arc<HashMap<String, Uuid>>,
    admin_key: Option<Arc<String>>,
}

impl AuthState {
    pub fn from_config(config: &AuthConfig) -> Self {
        let site_keys = config
            .api_keys
            .iter()
            .map(|k| (k.key.clone(), k.site_id))
            .collect();

        let admin_key = (!config.admin_key.is_empty()).then(|| Arc::new(config.admin_key.clone()));

        Self {
            site_keys: Arc::new(site_keys),
            admin_key,
        }
    }

    fn resolve_site_key(&self, token: &str) -> Option<Uuid> {
        // Constant-time scan; the registry is small and provisioned, not
        // user-controlled
        let mut found = None;
        for (key, site_id) in self.site_keys.iter() {
            if key.as_bytes().ct_eq(token.as_bytes()).into() {
                found = Some(*site_id);
            }
        }
        found
    }

    fn is_admin_key(&self, token: &str) -> bool {
        match &self.admin_key {
            Some(key) => key.as_bytes().ct_eq(token.as_bytes()).into(),
            None => false,
        }
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

fn extract_session_cookie(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(|c| c.trim())
                .find(|c| c.starts_with(SESSION_COOKIE_NAME))
                .and_then(|c| c.split('=').nth(1))
                .map(|v| v.to_string())
        })
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<AuthState>()
            .ok_or_else(|| ApiError::unauthorized("Auth state not configured"))?
            .clone();

        let site_header = parts
            .headers
            .get(ADMIN_SITE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        // Admin mode: platform admin key plus an explicit target site
        if let Some(admin_token) = parts
            .headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if !auth.is_admin_key(admin_token) {
                warn!("Rejected request with invalid admin key");
                return Err(ApiError::unauthorized("Invalid admin key"));
            }

            let site = site_header.ok_or_else(|| {
                ApiError::unauthorized("Admin requests must name a target site")
            })?;
            let site_id = Uuid::parse_str(&site)
                .map_err(|_| ApiError::validation("target site id is not a UUID"))?;

            debug!(site_id = %site_id, "Admin request acting on tenant");
            return Ok(TenantContext {
                site_id,
                principal: Principal::Admin,
            });
        }

        // A target-site header without the admin key is a takeover attempt
        if site_header.is_some() {
            return Err(ApiError::tenant_mismatch(
                "target site header requires the admin key",
            ));
        }

        // Bearer site key, then session cookie
        if let Some(token) = extract_bearer_token(parts) {
            if let Some(site_id) = auth.resolve_site_key(&token) {
                return Ok(TenantContext {
                    site_id,
                    principal: Principal::SiteKey,
                });
            }
            return Err(ApiError::unauthenticated("Unknown API key"));
        }

        if let Some(token) = extract_session_cookie(parts) {
            if let Some(site_id) = auth.resolve_site_key(&token) {
                return Ok(TenantContext {
                    site_id,
                    principal: Principal::Session,
                });
            }
            return Err(ApiError::unauthenticated("Invalid session"));
        }

        Err(ApiError::unauthenticated("Missing authentication token"))
    }
}
