//! Tracing subscriber setup for binaries and tests embedding the connector

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a human-readable subscriber filtered by `RUST_LOG` or `default_directive`.
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Same as [`init_tracing`] but emits one JSON object per event
pub fn init_json_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}
