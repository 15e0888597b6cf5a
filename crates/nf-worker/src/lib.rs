//! NotifyFabric Channel Workers
//!
//! This crate provides the delivery side of the pipeline:
//! - ChannelWorker: per-channel worker pool consuming the dispatch bus
//! - ChannelAdapter: provider-agnostic sender contract + HTTP implementation
//! - RetryPolicy: failure classification to backoff/terminal decisions
//! - CredentialResolver: lazy tenant credential resolution with a short TTL

pub mod adapter;
pub mod credentials;
pub mod retry;
pub mod worker;

pub use adapter::{ChannelAdapter, HttpAdapterConfig, HttpProviderAdapter};
pub use credentials::CredentialResolver;
pub use retry::RetryPolicy;
pub use worker::{ChannelWorker, ChannelWorkerConfig};
