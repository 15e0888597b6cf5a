//! API Error Envelope
//!
//! Every error leaves the API as `{code, message, details?}` with an explicit
//! code from the platform taxonomy. Worker-tier codes (ADAPTER_*,
//! CREDENTIALS_MISSING) never surface here; they are visible to clients only
//! as status transitions and history entries.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use nf_common::DeliveryStatus;
use nf_intake::IntakeError;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthenticated { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Tenant mismatch: {message}")]
    TenantMismatch { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Message is terminal: {status}")]
    TerminalConflict { status: DeliveryStatus },

    #[error("Invalid transition from {status}")]
    InvalidTransition { status: DeliveryStatus },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),
}

impl ApiError {
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn tenant_mismatch(message: impl Into<String>) -> Self {
        Self::TenantMismatch {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
            details: None,
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthenticated { .. } => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::TenantMismatch { .. } => (StatusCode::FORBIDDEN, "TENANT_MISMATCH"),
            ApiError::ValidationFailed { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::TerminalConflict { .. } => (StatusCode::CONFLICT, "TERMINAL_CONFLICT"),
            ApiError::InvalidTransition { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_TRANSITION")
            }
            ApiError::StorageUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_UNAVAILABLE")
            }
            ApiError::BusUnavailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BUS_UNAVAILABLE"),
        }
    }
}

/// Standard error response body
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let details = match &self {
            ApiError::ValidationFailed { details, .. } => details.clone(),
            _ => None,
        };

        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Validation { field, reason } => ApiError::ValidationFailed {
                message: format!("{field}: {reason}"),
                details: Some(serde_json::json!({ field: reason })),
            },
            IntakeError::NotFound(id) => ApiError::NotFound(id),
            IntakeError::NotCancellable { status } => {
                if status.is_terminal() {
                    ApiError::TerminalConflict { status }
                } else {
                    ApiError::InvalidTransition { status }
                }
            }
            IntakeError::Storage(message) => ApiError::StorageUnavailable(message),
            IntakeError::Bus(message) => ApiError::BusUnavailable(message),
        }
    }
}

impl From<nf_store::StoreError> for ApiError {
    fn from(e: nf_store::StoreError) -> Self {
        match e {
            nf_store::StoreError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::StorageUnavailable(other.to_string()),
        }
    }
}
