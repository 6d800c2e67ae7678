//! Logging setup
//!
//! Diagnostics go to stderr through `tracing`; stdout stays clean for the
//! NDJSON reporter.

use tracing_subscriber::EnvFilter;

/// Default filter directive for the given verbosity.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "suitecheck=debug"
    } else {
        "suitecheck=info"
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    // A second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "suitecheck=info");
        assert_eq!(default_directive(true), "suitecheck=debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
    }
}
