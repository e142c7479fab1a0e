//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level. Initialization happens at most
//! once per process; later calls, or a subscriber installed by someone else,
//! leave the existing one in place.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

static TRACING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Install the global subscriber. Returns `true` if this call installed it.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed_here = false;
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level));

        let layer = match config.format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .boxed(),
            "compact" => fmt::layer().compact().with_target(true).boxed(),
            _ => fmt::layer().with_target(true).with_thread_names(true).boxed(),
        };

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!(level = %config.level, format = %config.format, "tracing initialized");
        } else {
            tracing::debug!("global tracing subscriber already set; keeping it");
        }
        installed_here = installed;
        installed
    });
    installed_here
}
