//! Tracing subscriber configuration for weft nodes.
//!
//! Level conventions across the workspace:
//! - ERROR: protocol violations, unauthorized bypass attempts
//! - DEBUG: route mutations (links adopted, decays finished, bypasses)
//! - TRACE: per-parcel and per-message detail

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSection;

fn filter(section: &LoggingSection) -> EnvFilter {
    match section.level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize the global subscriber from a logging config section.
///
/// `RUST_LOG` wins when the section pins no level.
pub fn init(section: &LoggingSection) {
    if section.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter(section))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter(section))
            .init();
    }
}

/// Initialize for tests; tolerates repeated calls.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
