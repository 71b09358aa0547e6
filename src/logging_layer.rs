//! Tracing subscriber setup.
//!
//! Filtering comes from `RUST_LOG` (default `info`). Output is either
//! human-readable text or one JSON object per line.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{FlowtapError, Result};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_current_span(false)))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .try_init()
        .map_err(|e| FlowtapError::Logging {
            details: e.to_string(),
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // The first call may lose to another test's subscriber; the second
        // can never succeed.
        let _ = init_logging(LogFormat::Json);
        let second = init_logging(LogFormat::Text);
        assert!(matches!(second, Err(FlowtapError::Logging { .. })));
    }
}
