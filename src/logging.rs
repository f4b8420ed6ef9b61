//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable that overrides `[logging].level`.
pub const LOG_ENV: &str = "ANCHOR_LOG";

/// Build the filter: `ANCHOR_LOG` when set and valid, otherwise the
/// configured level.
pub fn env_filter(config_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(config_level))
}

/// Install the global subscriber, writing to stderr. Safe to call more
/// than once; later calls are ignored.
pub fn init(config_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config_level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
