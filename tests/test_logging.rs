//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format parsing and filter construction.

use iothub_transport::observability::logging::{filter_directives, parse_level, LogFormat};
use iothub_transport::observability::init_logging;
use tracing::Level;

#[test]
fn test_log_format_parse_known_formats() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Unknown formats fall back to JSON for production safety
    for input in ["invalid", "", "xml", "yaml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input}");
    }
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("Warn"), Level::WARN);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_filter_quiets_mqtt_client_noise() {
    let directives = filter_directives(Level::TRACE);

    assert!(directives.starts_with("trace"));
    assert!(directives.contains("rumqttc=warn"));
}

#[test]
fn test_second_initialization_fails_cleanly() {
    let _ = init_logging(Level::INFO, LogFormat::Compact, false);

    let second = init_logging(Level::DEBUG, LogFormat::Json, true);

    assert!(second.is_err());
}
