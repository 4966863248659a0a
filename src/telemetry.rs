//! Log output for binaries and demos embedding the relay.
//!
//! The library itself only emits `tracing` events. Call [`init_tracing`] once
//! from a binary to print them; `RUST_LOG` controls the filter.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "llm_relay=info";

/// Install a formatting subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already installed, which makes
/// repeated calls harmless.
pub fn init_tracing() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
