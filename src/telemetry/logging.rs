//! Logging configuration and initialization.
//!
//! Provides flexible logging setup with support for:
//! - Environment variable (RUST_LOG) configuration
//! - The `[log]` section of the daemon config file
//! - A `--verbose` override from the command line
//! - Multiple output formats (pretty, compact, json)

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Logging configuration from the `[log]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
}

impl LogConfig {
    /// Creates a new LogConfig with default values.
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }

    /// Same format, level forced to debug.
    pub fn verbose(&self) -> Self {
        Self {
            level: "debug".to_string(),
            format: self.format.clone(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global tracing subscriber for the daemon or the probe.
///
/// The filter comes from, in order:
/// 1. `RUST_LOG`, when set, even over `--verbose`
/// 2. `config`: the `[log]` section, already raised to debug by
///    [`LogConfig::verbose`] when `--verbose` was given
/// 3. `info`
///
/// The format comes from `config` only and defaults to pretty. A second
/// call is a no-op, so tests may call this freely.
///
/// ```ignore
/// let cfg = natpmpd::config::load(Path::new("natpmpd.toml"))?;
/// let log = if verbose { cfg.log.verbose() } else { cfg.log.clone() };
/// init_logging(Some(&log));
/// ```
pub fn init_logging(config: Option<&LogConfig>) {
    let env_filter = match config {
        _ if std::env::var_os("RUST_LOG").is_some() => EnvFilter::from_default_env(),
        Some(cfg) => EnvFilter::new(parse_level(&cfg.level).as_str()),
        None => EnvFilter::new("info"),
    };

    match config.map_or("pretty", |c| c.format.as_str()) {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            );
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

/// Level named in `[log] level`; anything unrecognised logs at info
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("info"), Level::INFO);
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("INFO"), Level::INFO);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_log_config_verbose() {
        let config = LogConfig {
            level: "warn".into(),
            format: "json".into(),
        };
        let verbose = config.verbose();
        assert_eq!(verbose.level, "debug");
        assert_eq!(verbose.format, "json");
    }

    #[test]
    fn test_init_logging_twice() {
        let config = LogConfig::new().verbose();
        init_logging(Some(&config));
        init_logging(None);
        assert!(tracing::dispatcher::has_been_set());
    }
}
