//! NotifyFabric REST API
//!
//! Versioned `/v1` surface over the intake service, with tenant context
//! extraction, the platform error envelope, and OpenAPI documentation.

use axum::{Extension, Router};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

pub mod api;
pub mod error;
pub mod tenant;

pub use api::{ApiState, notifications_router};
pub use error::{ApiError, ErrorBody};
pub use tenant::{AuthState, Principal, TenantContext};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "NotifyFabric API",
        description = "Multi-tenant notification dispatch platform",
        version = "0.1.0"
    ),
    tags((name = "notifications", description = "Notification intake and lifecycle"))
)]
pub struct ApiDoc;

/// Assemble the full HTTP router and its OpenAPI document.
pub fn build_router(api_state: ApiState, auth_state: AuthState) -> (Router, utoipa::openapi::OpenApi) {
    let (router, openapi) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/v1/notifications", notifications_router(api_state))
        .split_for_parts();

    (router.layer(Extension(auth_state)), openapi)
}
