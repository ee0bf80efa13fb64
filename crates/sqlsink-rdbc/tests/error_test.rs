//! Unit tests for sqlsink-rdbc error module

use sqlsink_rdbc::error::{Error, ErrorCategory};

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_connection_with_source() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    let err = Error::connection_with_source("failed to connect", io);

    assert!(std::error::Error::source(&err).is_some());
    assert!(err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("Invalid URL format");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("Invalid URL format"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_query() {
    let err = Error::query("Syntax error in SQL");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert!(err.to_string().contains("Syntax error"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_constraint() {
    let err = Error::Constraint {
        constraint_name: "readings_pkey".into(),
        message: "duplicate key value".into(),
    };

    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert!(err.to_string().contains("readings_pkey"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_pool_exhausted() {
    let err = Error::pool_exhausted("Timeout waiting for connection");

    assert_eq!(err.category(), ErrorCategory::PoolExhausted);
    assert!(err.is_retriable());
}

#[test]
fn test_error_unsupported() {
    let err = Error::unsupported("backend cannot switch database");

    assert_eq!(err.category(), ErrorCategory::Other);
    assert!(!err.is_retriable());
}

#[test]
fn test_error_category_display() {
    assert_eq!(ErrorCategory::Connection.to_string(), "connection");
    assert_eq!(ErrorCategory::PoolExhausted.to_string(), "pool_exhausted");
    assert_eq!(ErrorCategory::Other.to_string(), "other");
}
