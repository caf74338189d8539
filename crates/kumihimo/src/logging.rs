//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. the level passed by the caller (if any)
//! 2. the `KUMIHIMO_LOG` environment variable, as an `EnvFilter` directive
//!    (e.g. "info" or "kumihimo=debug")
//! 3. default to `info`

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable read when no level is given.
pub const LOG_ENV: &str = "KUMIHIMO_LOG";

/// Installs the global fmt subscriber.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(level: Option<Level>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level, std::env::var(LOG_ENV).ok()))
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
}

fn filter(level: Option<Level>, env: Option<String>) -> EnvFilter {
    if let Some(level) = level {
        return EnvFilter::new(level.to_string().to_lowercase());
    }
    env.and_then(|directives| EnvFilter::try_new(directives.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Parses a level name, accepting `warning` for `warn`.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        other => other.parse().ok(),
    }
}
