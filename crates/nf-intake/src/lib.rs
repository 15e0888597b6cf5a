//! NotifyFabric Intake
//!
//! Tenant-scoped acceptance of notification intents: validation, idempotent
//! persistence, immediate or scheduled hand-off to the dispatch bus, and
//! cancellation of not-yet-final messages.

use nf_common::DeliveryStatus;
use thiserror::Error;

pub mod scheduler;
pub mod service;

pub use scheduler::SchedulerLoop;
pub use service::{BulkEntryOutcome, BulkEntryStatus, IntakeService, SubmitOutcome};

pub type Result<T> = std::result::Result<T, IntakeError>;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Message is not cancellable from {status}")]
    NotCancellable { status: DeliveryStatus },

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Bus unavailable: {0}")]
    Bus(String),
}

impl IntakeError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<nf_store::StoreError> for IntakeError {
    fn from(e: nf_store::StoreError) -> Self {
        match e {
            nf_store::StoreError::NotFound(id) => IntakeError::NotFound(id),
            other => IntakeError::Storage(other.to_string()),
        }
    }
}

impl From<nf_bus::BusError> for IntakeError {
    fn from(e: nf_bus::BusError) -> Self {
        IntakeError::Bus(e.to_string())
    }
}
