//! Subscriber setup for binaries that drive a detector.
//!
//! The library only emits events: resolved export names and per-frame
//! results at `debug`, each probe attempt at `debug`, the chosen binding at
//! `info`, and swallowed best-effort failures at `warn`. A host that already
//! installs its own subscriber should not call anything here.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a stderr subscriber filtered at `info`.
pub fn init() {
    init_with_filter("info");
}

/// Install a stderr subscriber with `default_filter` (e.g. `"atag_core=debug"`
/// to see every probe attempt). `RUST_LOG` wins when set.
///
/// Events are written to stderr; stdout is left to the caller.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .init();
}
