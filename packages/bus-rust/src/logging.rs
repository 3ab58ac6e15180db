//! Tracing subscriber setup for processes hosting channel groups.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,courier_bus=debug";

/// Installs the global tracing subscriber.
///
/// Respects `RUST_LOG`; falls back to [`DEFAULT_FILTER`]. `json` selects
/// newline-delimited JSON output instead of the human-readable format.
///
/// Returns `false` when a global subscriber was already installed, so
/// repeated calls (e.g. from several tests) are harmless.
pub fn init_tracing(json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.is_ok()
}
