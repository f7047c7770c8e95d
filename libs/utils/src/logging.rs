//! Tracing setup shared by the binary and by embedders exercising the
//! crate in-process.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber reading its filter from
/// `RUST_LOG` (falling back to `info`). `json` selects structured
/// output suitable for log shipping; otherwise a compact human-readable
/// format is used.
///
/// Panics if a global subscriber has already been installed; callers
/// that may run this more than once (tests) should guard with
/// `std::sync::Once` or call it from a single `main`.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .init();
    } else {
        fmt().with_env_filter(filter).compact().init();
    }
}
