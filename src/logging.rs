//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem, with
//! human-readable or JSON output selected via environment variables.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "info", "debug,tilepool=trace")
//! - `TILEPOOL_LOG_FORMAT`: output format ("human" or "json")

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Default log level when no environment variable is set
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "TILEPOOL_LOG_FORMAT";

/// Initialize tracing once for the process.
///
/// Safe to call multiple times; only the first call installs a subscriber.
/// If another subscriber is already installed the call is a no-op.
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

        let json = std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if json {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init();
        } else {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .try_init();
        }
    });
}

/// Whether `init_logging` has run in this process.
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        assert!(is_initialized());
        // second call must not panic
        init_logging();
        assert!(is_initialized());
    }
}
