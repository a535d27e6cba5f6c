//! Structured logging system using tracing crate
//!
//! Provides contextual, machine-readable logging with span macros for
//! transport and pool operations.
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON for production and log aggregation
//! - `pretty` - Human-readable, colored, indented
//! - `compact` - Colored but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty, compact (default json)
//! - `LOG_SPANS`: include span open/close events (default false)
//! - `RUST_LOG`: overrides filtering entirely (env_logger syntax)

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are too chatty at the application level
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Filter directives for `level` with dependency noise reduced
pub fn filter_directives(level: Level) -> String {
    let mut directives = level.to_string().to_lowercase();
    for dependency in QUIET_DEPENDENCIES {
        directives.push_str(&format!(",{dependency}=warn"));
    }
    directives
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) -> Result<(), TryInitError> {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => EnvFilter::new(filter_directives(level)),
    };
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() -> Result<(), TryInitError> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans)
}

/// Create a transport operation span
#[macro_export]
macro_rules! transport_span {
    ($($field:tt)*) => {
        tracing::info_span!("transport_operation", $($field)*)
    };
}

/// Create a connection pool span
#[macro_export]
macro_rules! pool_span {
    ($($field:tt)*) => {
        tracing::info_span!("pool_operation", $($field)*)
    };
}

pub use {pool_span, transport_span};
