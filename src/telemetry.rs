//! Structured logging setup
//!
//! One process-wide tracing subscriber. `RUST_LOG` overrides the built-in
//! directives; otherwise the crate logs at the level resolved from config
//! and CLI, with `tower_http` pinned to debug for request traces.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Default filter directives when `RUST_LOG` is absent
fn default_directives(level: &str) -> String {
    format!("duoroute={level},tower_http=debug")
}

/// Install the global subscriber
///
/// Safe to call more than once: only the first call installs anything,
/// later calls are no-ops.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(default_level)));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
