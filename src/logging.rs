//! Structured logging setup.
//!
//! Thin wrapper around `tracing-subscriber`: reads the configured level,
//! honors `RUST_LOG` when set, and picks an output format. Idempotent —
//! safe to call more than once (from tests, or if a host process already
//! initialized a subscriber).

use crate::config::Settings;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable, colorized (development).
    Pretty,
    /// Single-line structured JSON (production / log aggregation).
    Json,
}

pub fn init(settings: &Settings, format: OutputFormat) -> Result<(), String> {
    let level = parse_log_level(&settings.log_level)?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_to_str(level)));

    let result = match format {
        OutputFormat::Pretty => {
            let layer = fmt::layer().pretty().with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer().json().with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    result.or_else(|e| {
        if e.to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("failed to initialize tracing: {e}"))
        }
    })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!("invalid log level '{other}'")),
    }
}

fn level_to_str(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("DEBUG"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }
}
