#![deny(warnings)]
#![warn(unused_extern_crates)]
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use tracing_forest::printer::TestCapturePrinter;
use tracing_forest::tag::NoTag;
use tracing_forest::ForestLayer;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

pub use {tracing, tracing_forest, tracing_subscriber};

/// Start up the logging for test mode.
pub fn test_init() {
    let filter = EnvFilter::from_default_env()
        .add_directive(LevelFilter::TRACE.into())
        // ldap3 and its tokio codec are extremely chatty at trace.
        .add_directive("ldap3=INFO".parse().expect("failed to generate log filter"));

    // start the logging!
    let _ = tracing_subscriber::Registry::default()
        .with(ForestLayer::new(TestCapturePrinter::new(), NoTag).with_filter(filter))
        .try_init();
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err("Must be one of info, debug, trace"),
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

impl From<LogLevel> for EnvFilter {
    fn from(value: LogLevel) -> Self {
        let level = match value {
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        };
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy()
    }
}

/// Start the process wide logging for a tool or daemon. RUST_LOG directives are
/// still honoured on top of the selected level.
pub fn start_logging(log_level: LogLevel) -> Result<(), String> {
    let filter: EnvFilter = log_level.into();
    tracing_subscriber::Registry::default()
        .with(ForestLayer::default().with_filter(filter))
        .try_init()
        .map_err(|err| format!("Failed to start logging: {:?}", err))
}

#[cfg(test)]
mod tests {
    use super::LogLevel;
    use std::str::FromStr;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::from_str("DEBUG"), Ok(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("trace"), Ok(LogLevel::Trace));
        assert!(LogLevel::from_str("verbose").is_err());
        assert_eq!(LogLevel::default().to_string(), "info");
    }
}
