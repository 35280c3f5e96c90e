//! Tracing initialization.
//!
//! Structured logs go to stdout through `tracing-subscriber`; verbosity is
//! controlled with `RUST_LOG` (e.g. `RUST_LOG=compact_allocator_rs=debug`).

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Call once, before anything logs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
