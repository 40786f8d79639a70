//! Shared tracing bootstrap for StrataLake binaries and tests.

use crate::{Error, Result};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize the global tracing subscriber for a component.
///
/// Call once per process; a second call reports a configuration error.
pub fn init(component: &str, log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .try_init()
        .map_err(|e| Error::Config(format!("failed to initialize tracing subscriber: {e}")))?;

    info!(component, log_level, "Telemetry initialized");
    Ok(())
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_known_levels() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level(" DEBUG ").unwrap(), Level::DEBUG);
    }

    #[test]
    fn parse_log_level_rejects_unknown() {
        let err = parse_log_level("loud").unwrap_err();
        assert!(format!("{err}").contains("invalid log level"));
    }
}
