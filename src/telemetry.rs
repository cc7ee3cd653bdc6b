//! Tracing initialization
//!
//! Structured logging via `tracing` with an env-filter: `RUST_LOG` wins
//! when set, otherwise the caller's default directive applies. Library code
//! only emits events; installing a subscriber is the embedding
//! application's decision, which is why this lives behind an explicit call.

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Install a formatted tracing subscriber
///
/// `default_filter` is used when `RUST_LOG` is not set, e.g. `"info"` or
/// `"trellis=debug,info"`. Fails if a global subscriber is already
/// installed.
pub fn init(default_filter: &str) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}
