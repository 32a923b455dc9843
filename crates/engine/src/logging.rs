//! Tracing subscriber initialization.
//!
//! The engines only emit `tracing` events and never install a subscriber
//! themselves; call [`init`] once at startup (demos and tests do) to get
//! formatted logs on stdout. The level is controlled through `RUST_LOG`,
//! defaulting to `info`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global fmt subscriber with `RUST_LOG` filtering.
///
/// Later calls are no-ops, so tests can call it freely.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).try_init();
}
