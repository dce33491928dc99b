//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber
//! - Resolve the log filter from `RUST_LOG` or configuration
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` wins over the configured level when set

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives for a configured level.
pub fn default_directives(level: &str) -> String {
    format!("metrics_gateway={level},tower_http={level}")
}

/// Install the global subscriber. Safe to call more than once.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_cover_crate_and_http_layer() {
        assert_eq!(default_directives("warn"), "metrics_gateway=warn,tower_http=warn");
    }
}
