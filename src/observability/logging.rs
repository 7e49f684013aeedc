//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! `LOG_FORMAT` selects the output:
//!
//! - `json` - structured JSON for log aggregation
//! - `pretty` - colored, indented output for development
//! - `compact` - colored single-line output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty, compact (default json)
//! - `LOG_SPANS`: emit span open/close events (default false)
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG fbns-listener listen
//! ```
//!
//! Logs go to stderr; stdout is reserved for delivered notifications.

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn parse_flag(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

/// Level filter with TLS and runtime internals held at warn
pub fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }
    EnvFilter::new(format!("{level},rustls=warn,tokio_rustls=warn,tokio=warn"))
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let installed = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if let Err(e) = installed {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}

/// Initialize from the environment; `verbose` raises the default level to DEBUG
pub fn init_default_logging(verbose: bool) {
    let default_level = if verbose { "DEBUG" } else { "INFO" };
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| default_level.to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = parse_flag(&env::var("LOG_SPANS").unwrap_or_default());

    init_logging(level, format, include_spans);
}

/// Span covering one CONNECT/CONNACK/registration exchange
#[macro_export]
macro_rules! handshake_span {
    ($($field:tt)*) => {
        tracing::info_span!("fbns_handshake", $($field)*)
    };
}

/// Span covering a transport operation
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

pub use {handshake_span, mqtt_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("invalid", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_log_spans_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("1"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_span_events() {
        assert_eq!(span_events(false), FmtSpan::NONE);
        assert_eq!(span_events(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(Level::INFO, LogFormat::Compact, false);
        init_logging(Level::DEBUG, LogFormat::Json, true);
    }

    #[test]
    fn test_span_macros_build_spans() {
        let span = crate::handshake_span!(client_id = "abc");
        let _guard = span.enter();
        let _mqtt = crate::mqtt_span!(op = "connect");
    }
}
