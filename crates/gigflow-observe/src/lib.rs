//! Tracing subscriber initialization for Gigflow binaries and tests.
//!
//! Respects `RUST_LOG` through `EnvFilter`, defaulting to `info` when the
//! variable is unset or malformed.
//!
//! ```no_run
//! gigflow_observe::init_tracing(gigflow_observe::LogFormat::Text).unwrap();
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output.
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set (e.g. called twice).
pub fn init_tracing(format: LogFormat) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    }
}
