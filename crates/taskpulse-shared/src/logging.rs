//! Tracing initialization for binaries and tests.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber once.
///
/// `RUST_LOG` controls filtering (default `info`); `TASKPULSE_LOG_JSON=1`
/// switches to JSON output for log shippers.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("TASKPULSE_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if json {
            fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        } else {
            fmt().with_env_filter(filter).init();
        }
    });
}
