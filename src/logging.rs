//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured `log_level` applies to the whole
//! process. Production environments get one JSON object per line, everything else the
//! human-readable formatter.

use crate::config::Settings;
use tracing_subscriber::EnvFilter;

fn filter_for(settings: &Settings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log_level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns `false` when one was already installed.
pub fn init(settings: &Settings) -> bool {
    let filter = filter_for(settings);
    let installed = if settings.is_production() {
        tracing_subscriber::fmt()
            .json()
            .with_current_span(false)
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    };
    if installed {
        tracing::debug!(
            service = %settings.service_name,
            environment = %settings.environment,
            "logging initialized"
        );
    }
    installed
}
