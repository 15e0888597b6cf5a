//! Structured Logging
//!
//! JSON output for production (LOG_FORMAT=json), human-readable text for
//! development. Worker code runs each delivery attempt inside the span from
//! [`delivery_span`], so nested log lines carry site_id, message_id, channel
//! and attempt without repeating them at every call site.
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: "json" for JSON output, anything else for text (default: text)
//! - `RUST_LOG`: Standard log level filter (default: info)
//!   Examples: `RUST_LOG=debug`, `RUST_LOG=nf_worker=trace,tower_http=info`

use tracing::Span;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

use crate::NotificationChannel;

/// Log output format, selected via LOG_FORMAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text for development
    Text,
    /// JSON for production log aggregation
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Initialize logging for a service binary.
///
/// Reads LOG_FORMAT for the output format and RUST_LOG for filtering.
pub fn init_logging(service_name: &str) {
    init_with_format(service_name, LogFormat::from_env());
}

/// Initialize logging with an explicit format.
pub fn init_with_format(service_name: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_target(true)
                        .flatten_event(true)
                        .with_span_events(FmtSpan::CLOSE),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true).with_ansi(true))
                .init();
        }
    }

    tracing::info!(service = service_name, format = ?format, "Logging initialized");
}

/// Span carrying tenant and message identity through one delivery attempt.
pub fn delivery_span(
    site_id: Uuid,
    message_id: &str,
    channel: NotificationChannel,
    attempt: u32,
) -> Span {
    tracing::info_span!(
        "delivery",
        site_id = %site_id,
        message_id = %message_id,
        channel = %channel,
        attempt = attempt
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        drop(filter);
    }

    #[test]
    fn test_delivery_span_builds_without_subscriber() {
        let span = delivery_span(Uuid::new_v4(), "m1", NotificationChannel::Email, 2);
        drop(span);
    }
}
