//! Error types for CDC operations
//!
//! Errors are classified so that callers can tell transient failures
//! (safe to retry from the last applied position) from failures that
//! threaten the snapshot/log continuity invariant (never retried).

use crate::common::position::HighWaterMark;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source database errors (reachability, isolation guarantees)
    Source,
    /// Change log errors (gaps, broken subscriptions)
    Replication,
    /// Schema-related errors (drift, missing keys)
    Schema,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Convergence checks run by the verification harness
    Verification,
    /// Other/unknown errors
    Other,
}

/// CDC-specific errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// The source could not be reached to open a snapshot.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source cannot read the table and capture the mark atomically.
    #[error("Isolation violation: {0}")]
    IsolationViolation(String),

    /// The requested start position has been purged from the retained log.
    #[error("Log gap: requested start after {requested} but the log is purged through {purged_through}")]
    LogGap {
        requested: HighWaterMark,
        purged_through: HighWaterMark,
    },

    /// Table schema no longer matches the schema recorded at registration.
    #[error("Schema changed for {table}: {detail}")]
    SchemaChanged { table: String, detail: String },

    /// The materialized view did not converge within the configured bound.
    #[error("Consistency timeout after {elapsed:?}: expected {expected} rows, observed {observed}")]
    ConsistencyTimeout {
        expected: u64,
        observed: u64,
        elapsed: Duration,
    },

    /// MySQL client error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    MySql(String),

    /// Replication stream error
    #[error("Replication error: {0}")]
    Replication(String),

    /// Schema error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    /// Create a source unavailable error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create an isolation violation error
    pub fn isolation_violation(msg: impl Into<String>) -> Self {
        Self::IsolationViolation(msg.into())
    }

    /// Create a schema changed error
    pub fn schema_changed(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaChanged {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// Create a new MySQL error
    #[cfg(feature = "mysql")]
    pub fn mysql(msg: impl Into<String>) -> Self {
        Self::MySql(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Only transient tail-side failures qualify. Snapshot start failures,
    /// log gaps and schema drift put correctness at risk and are surfaced.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Timeout(_) => true,

            Self::Replication(msg) => {
                msg.contains("temporarily")
                    || msg.contains("connection reset")
                    || msg.contains("connection lost")
            }

            #[cfg(feature = "mysql")]
            Self::MySql(msg) => {
                msg.contains("Lost connection") || msg.contains("Lock wait timeout")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::SourceUnavailable(_)
            | Self::IsolationViolation(_)
            | Self::LogGap { .. }
            | Self::SchemaChanged { .. }
            | Self::ConsistencyTimeout { .. }
            | Self::Schema(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Whether the connector instance must stop and be resnapshotted.
    pub fn requires_resnapshot(&self) -> bool {
        matches!(self, Self::LogGap { .. } | Self::SchemaChanged { .. })
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SourceUnavailable(_) | Self::IsolationViolation(_) => ErrorCategory::Source,
            #[cfg(feature = "mysql")]
            Self::MySql(_) => ErrorCategory::Source,
            Self::LogGap { .. } | Self::Replication(_) => ErrorCategory::Replication,
            Self::SchemaChanged { .. } | Self::Schema(_) => ErrorCategory::Schema,
            Self::ConsistencyTimeout { .. } => ErrorCategory::Verification,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Timeout(_) | Self::ConnectionClosed | Self::Io(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::IsolationViolation(_) => "isolation_violation",
            Self::LogGap { .. } => "log_gap",
            Self::SchemaChanged { .. } => "schema_changed",
            Self::ConsistencyTimeout { .. } => "consistency_timeout",
            #[cfg(feature = "mysql")]
            Self::MySql(_) => "mysql_error",
            Self::Replication(_) => "replication_error",
            Self::Schema(_) => "schema_error",
            Self::Config(_) => "config_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::LogGap {
            requested: HighWaterMark::new(10),
            purged_through: HighWaterMark::new(42),
        };
        let msg = err.to_string();
        assert!(msg.contains("Log gap"));
        assert!(msg.contains("10"));
        assert!(msg.contains("42"));

        let err = CdcError::schema_changed("public.t", "column f2 dropped");
        assert_eq!(
            err.to_string(),
            "Schema changed for public.t: column f2 dropped"
        );
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CdcError::ConnectionClosed.is_retriable());
        assert!(CdcError::timeout("5s").is_retriable());
        assert!(CdcError::replication("connection reset by peer").is_retriable());

        assert!(!CdcError::source_unavailable("refused").is_retriable());
        assert!(!CdcError::isolation_violation("no gtid").is_retriable());
        assert!(!CdcError::replication("corrupt event").is_retriable());
        assert!(!CdcError::config("bad config").is_retriable());
        assert!(!CdcError::LogGap {
            requested: HighWaterMark::new(1),
            purged_through: HighWaterMark::new(2),
        }
        .is_retriable());
    }

    #[test]
    fn test_requires_resnapshot() {
        assert!(CdcError::schema_changed("t", "x").requires_resnapshot());
        assert!(CdcError::LogGap {
            requested: HighWaterMark::ZERO,
            purged_through: HighWaterMark::new(5),
        }
        .requires_resnapshot());
        assert!(!CdcError::ConnectionClosed.requires_resnapshot());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CdcError::source_unavailable("x").category(),
            ErrorCategory::Source
        );
        assert_eq!(
            CdcError::replication("x").category(),
            ErrorCategory::Replication
        );
        assert_eq!(CdcError::schema("x").category(), ErrorCategory::Schema);
        assert_eq!(
            CdcError::ConsistencyTimeout {
                expected: 1,
                observed: 0,
                elapsed: Duration::from_secs(1),
            }
            .category(),
            ErrorCategory::Verification
        );
        assert_eq!(
            CdcError::ConnectionClosed.category(),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CdcError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(
            CdcError::isolation_violation("x").error_code(),
            "isolation_violation"
        );
        assert_eq!(CdcError::config("x").error_code(), "config_error");
    }
}
