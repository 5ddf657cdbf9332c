//! Error types for the scangate pipeline.
//!
//! Errors are grouped along the boundaries the system actually crosses:
//! the Redis state store, the clamd engine socket, the task wire format,
//! and local resources. `is_recoverable` drives the retry policy — only
//! transient I/O is retried; everything else surfaces as a definitive
//! `ERROR` verdict or a rejected request.

use std::time::Duration;
use thiserror::Error;

/// The main error type for scan pipeline operations.
#[derive(Debug, Error)]
pub enum ScanError {
    /// A state-store (Redis) operation failed.
    #[error("store operation '{op}' failed: {message}")]
    Store {
        /// The operation that failed (e.g. "BRPOP", "BLMOVE").
        op: &'static str,
        /// Underlying error message.
        message: String,
    },

    /// Failed to connect to or converse with the scanning engine.
    #[error("engine at '{endpoint}' unreachable: {message}")]
    EngineConnection {
        /// The clamd endpoint URL.
        endpoint: String,
        /// Underlying error message.
        message: String,
    },

    /// The engine returned something outside its line protocol.
    #[error("engine protocol error: {details}")]
    EngineProtocol {
        /// What was received instead.
        details: String,
    },

    /// The engine reported a scan-side ERROR verdict.
    #[error("engine reported error: {details}")]
    EngineReported {
        /// The ERROR line from clamd.
        details: String,
    },

    /// An operation exceeded its deadline.
    #[error("'{what}' timed out after {elapsed:?}")]
    Timeout {
        /// Description of the timed-out operation.
        what: &'static str,
        /// How long it ran before the deadline.
        elapsed: Duration,
    },

    /// A queue element or wire header could not be understood.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the malformed input.
        reason: String,
    },

    /// The body exceeds the absolute size cap.
    #[error("body size {size} bytes exceeds cap of {cap} bytes")]
    BodyTooLarge {
        /// Observed size so far.
        size: u64,
        /// Configured absolute cap.
        cap: u64,
    },

    /// An I/O error on the shared-disk data plane.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was torn down by the peer before completion.
    #[error("stream cancelled by peer")]
    Cancelled,

    /// Configuration error detected at startup.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl ScanError {
    /// Returns `true` if this error is transient and worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::EngineConnection { .. } | Self::Timeout { .. }
        )
    }

    /// Creates a `Store` error.
    pub fn store(op: &'static str, message: impl Into<String>) -> Self {
        Self::Store {
            op,
            message: message.into(),
        }
    }

    /// Creates an `EngineConnection` error.
    pub fn engine_connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EngineConnection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates an `EngineProtocol` error.
    pub fn engine_protocol(details: impl Into<String>) -> Self {
        Self::EngineProtocol {
            details: details.into(),
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(what: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { what, elapsed }
    }

    /// Creates a `ProtocolViolation` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ScanError::store("BRPOP", "connection reset").is_recoverable());
        assert!(ScanError::engine_connection("tcp://127.0.0.1:3310", "refused").is_recoverable());
        assert!(ScanError::timeout("verdict", Duration::from_secs(30)).is_recoverable());

        assert!(!ScanError::protocol("bad header").is_recoverable());
        assert!(!ScanError::BodyTooLarge {
            size: 3 << 30,
            cap: 2 << 30,
        }
        .is_recoverable());
        assert!(!ScanError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = ScanError::store("BLMOVE", "timed out");
        assert!(err.to_string().contains("BLMOVE"));

        let err = ScanError::BodyTooLarge { size: 100, cap: 50 };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));
    }
}
