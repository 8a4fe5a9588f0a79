//! Tracing subscriber setup driven by the configuration file.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Initialize the global subscriber. `RUST_LOG` overrides the configured
/// level when set. Worker, task and crawl identity (`gwn`, `subsys`, `id`)
/// ride on spans, so both formats carry them per line.
pub fn init(config: &Config) {
    let default_level = if config.debug_level_logging {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
