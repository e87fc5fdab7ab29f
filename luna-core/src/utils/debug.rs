use std::sync::atomic::Ordering;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

/// Install the global `tracing` subscriber.
///
/// `LUNA_DEBUG=1` raises the default level to `DEBUG` and turns on per-call shape logging in
/// the attention unit; `RUST_LOG` directives still take precedence. Later calls keep the
/// first subscriber.
pub fn initialize_logging() {
    let is_debug = std::env::var("LUNA_DEBUG")
        .map(|v| v.contains('1'))
        .unwrap_or(false);
    DEBUG.store(is_debug, Ordering::Relaxed);

    let default_level = if is_debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::trace!("tracing subscriber already installed");
    }
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}
