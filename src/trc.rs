//! Tracing configuration and initialization.
//!
//! The `-logLevel` flag picks a baseline filter; a `RUST_LOG`-style
//! environment filter, when present, wins outright so operators can
//! scope verbosity per module without touching the flag.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Call once, before any mounting.
pub fn init(log_level: u8) {
    let fallback = match log_level {
        0 => "error",
        1 => "warn",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
