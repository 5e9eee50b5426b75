use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV: &str = "PODCAST_SYNC_LOG";

/// Installs the global tracing subscriber.
///
/// Logs go to stderr so an observer drawing progress on stdout is left alone.
/// Calling this twice is harmless; the second install is ignored.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .try_init();
}
