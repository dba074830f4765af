//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=rust_sweep::engine=trace` works as usual.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Build the filter: `RUST_LOG` if set and valid, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Calling this twice is harmless; the
/// second call returns an error that callers may ignore.
pub fn init(config: &ApplicationConfig) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.log_level))
        .with_target(true);

    let result = if config.log_json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
