//! Tracing bootstrap for binaries and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the embedder's job. The serve binary calls [`init`] once at startup.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// The filter is taken from `MNEMORA_LOG` (falling back to `RUST_LOG`, then
/// the provided default directive). Repeated calls are ignored so tests can
/// call this freely.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_env("MNEMORA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
