//! Logging setup for the coordinator
//!
//! Thin wrapper over `tracing-subscriber`. Call once at startup;
//! `RUST_LOG` overrides the configured filter.

use tracing_subscriber::EnvFilter;

/// Initializes logging at `info`, the coordinator's operational level.
pub fn init_logging() {
    init_logging_with_filter("info");
}

/// Initializes logging with a custom filter string, e.g.
/// `"info,fedcluster::clustering=debug"` to trace clustering rounds.
pub fn init_logging_with_filter(filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_parse() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("info,fedcluster::clustering=debug").is_ok());
        assert!(EnvFilter::try_new("warn,fedcluster::orchestrator=trace").is_ok());
    }
}
