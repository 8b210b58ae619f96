//! Error types for the realm-ledger backend.
//!
//! This module provides a unified error type [`LedgerError`] covering every
//! layer of the system: configuration, RPC access, event decoding, database
//! persistence, checkpointing, pricing and payment matching.
//!
//! # Design
//!
//! The error hierarchy is organized by layer:
//! - [`LedgerError::ConfigError`]: Configuration and environment issues
//! - [`LedgerError::RpcError`]: RPC provider and network errors, carrying a
//!   transient/permanent classification used by the retry layer
//! - [`LedgerError::DecodingError`]: Event decoding and parsing errors
//! - [`LedgerError::DatabaseError`]: Persistence errors
//! - [`LedgerError::StateError`]: Derived-state and validation errors
//! - [`LedgerError::NonMonotonicCheckpoint`]: Checkpoint regression (bug-class,
//!   fails loudly and stops the offending indexer)
//! - [`LedgerError::NoPrice`]: No price source could value a token
//!
//! All errors implement [`std::error::Error`] and include rich context via
//! the source error chain. RPC errors additionally expose [`RpcErrorKind`] so
//! the chain client can decide between retrying, halving the scan batch, and
//! propagating.

use std::fmt;

/// Result type alias using [`LedgerError`].
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Classification of an RPC failure, driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Timeouts, rate limits, 5xx responses. Retried with back-off.
    Transient,
    /// The log query covered too wide a block range for the endpoint.
    /// Retried after halving the batch size.
    RangeTooWide,
    /// Malformed request, unknown method, invalid address. Never retried.
    Permanent,
}

/// Unified error type for the realm-ledger backend.
#[derive(Debug)]
pub enum LedgerError {
    /// Configuration or environment variable errors.
    ConfigError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// RPC provider or network errors.
    RpcError {
        /// Human-readable error message
        message: String,
        /// Transient/permanent classification for the retry layer
        kind: RpcErrorKind,
        /// Optional underlying error
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Event decoding or parsing errors.
    ///
    /// Decoders are total: a malformed log produces this variant, the
    /// offending record is skipped and the checkpoint still advances.
    DecodingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database operation errors.
    DatabaseError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Derived-state or validation errors (negative stake, bad range).
    StateError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A checkpoint advance attempted to move the cursor backwards.
    ///
    /// This is a bug-class condition: the owning indexer stops rather than
    /// risk double-ingesting or skipping a range.
    NonMonotonicCheckpoint {
        /// Cursor value currently persisted
        current: u64,
        /// Regressing value that was rejected
        attempted: u64,
    },

    /// Arithmetic or conversion errors (overflow, division by zero).
    MathError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No price source could value the token. Surfaced as `UNVALUED` in
    /// derived rows; never fails ingestion.
    NoPrice {
        /// Chain the token lives on
        chain_id: u64,
        /// Token address that could not be priced
        token: String,
    },

    /// Two pending payment requests matched the same transfer under
    /// different strategies. Resolved by strategy priority; logged.
    PaymentConflict {
        /// Human-readable error message
        message: String,
    },
}

impl LedgerError {
    /// Create a new configuration error.
    #[must_use]
    pub fn config(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ConfigError {
            message: message.into(),
            source,
        }
    }

    /// Create a transient RPC error (retried with back-off).
    #[must_use]
    pub fn rpc_transient(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::RpcError {
            message: message.into(),
            kind: RpcErrorKind::Transient,
            source,
        }
    }

    /// Create a permanent RPC error (propagated, never retried).
    #[must_use]
    pub fn rpc_permanent(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::RpcError {
            message: message.into(),
            kind: RpcErrorKind::Permanent,
            source,
        }
    }

    /// Create a range-too-wide RPC error (batch is halved and retried).
    #[must_use]
    pub fn rpc_range_too_wide(message: impl Into<String>) -> Self {
        Self::RpcError {
            message: message.into(),
            kind: RpcErrorKind::RangeTooWide,
            source: None,
        }
    }

    /// Create a new decoding error.
    #[must_use]
    pub fn decoding(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::DecodingError {
            message: message.into(),
            source,
        }
    }

    /// Create a new database error.
    #[must_use]
    pub fn database(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::DatabaseError {
            message: message.into(),
            source,
        }
    }

    /// Create a new state error.
    #[must_use]
    pub fn state(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::StateError {
            message: message.into(),
            source,
        }
    }

    /// Create a new math error.
    #[must_use]
    pub fn math(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::MathError {
            message: message.into(),
            source,
        }
    }

    /// Create a no-price error for a token.
    #[must_use]
    pub fn no_price(chain_id: u64, token: impl Into<String>) -> Self {
        Self::NoPrice {
            chain_id,
            token: token.into(),
        }
    }

    /// Whether this error should be retried by the chain client.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RpcError {
                kind: RpcErrorKind::Transient | RpcErrorKind::RangeTooWide,
                ..
            }
        )
    }

    /// Whether this error signals the log query range was too wide.
    #[must_use]
    pub const fn is_range_too_wide(&self) -> bool {
        matches!(
            self,
            Self::RpcError {
                kind: RpcErrorKind::RangeTooWide,
                ..
            }
        )
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError { message, .. } => write!(f, "Configuration error: {message}"),
            Self::RpcError { message, kind, .. } => {
                write!(f, "RPC error ({kind:?}): {message}")
            }
            Self::DecodingError { message, .. } => write!(f, "Decoding error: {message}"),
            Self::DatabaseError { message, .. } => write!(f, "Database error: {message}"),
            Self::StateError { message, .. } => write!(f, "State error: {message}"),
            Self::NonMonotonicCheckpoint { current, attempted } => write!(
                f,
                "Non-monotonic checkpoint advance: current {current}, attempted {attempted}"
            ),
            Self::MathError { message, .. } => write!(f, "Math error: {message}"),
            Self::NoPrice { chain_id, token } => {
                write!(f, "No price for token {token} on chain {chain_id}")
            }
            Self::PaymentConflict { message } => write!(f, "Payment match conflict: {message}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigError { source, .. }
            | Self::RpcError { source, .. }
            | Self::DecodingError { source, .. }
            | Self::DatabaseError { source, .. }
            | Self::StateError { source, .. }
            | Self::MathError { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &dyn std::error::Error),
            Self::NonMonotonicCheckpoint { .. }
            | Self::NoPrice { .. }
            | Self::PaymentConflict { .. } => None,
        }
    }
}

/// Convert from `sqlx::Error` to `LedgerError`.
impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from `eyre::Report` to `LedgerError`.
///
/// Used for wrapping errors that don't fit a specific category; classified
/// as a transient RPC error by default.
impl From<eyre::Report> for LedgerError {
    fn from(err: eyre::Report) -> Self {
        Self::RpcError {
            message: err.to_string(),
            kind: RpcErrorKind::Transient,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error() {
        let err = LedgerError::config("test error", None);
        assert!(matches!(err, LedgerError::ConfigError { .. }));
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_rpc_transient_classification() {
        let err = LedgerError::rpc_transient("connection reset", None);
        assert!(err.is_transient());
        assert!(!err.is_range_too_wide());
    }

    #[test]
    fn test_rpc_permanent_classification() {
        let err = LedgerError::rpc_permanent("malformed address", None);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_range_too_wide_is_transient() {
        // A too-wide range is retried (after the batch is halved), so it
        // counts as transient for the retry policy.
        let err = LedgerError::rpc_range_too_wide("query returned more than 10000 results");
        assert!(err.is_transient());
        assert!(err.is_range_too_wide());
    }

    #[test]
    fn test_non_monotonic_checkpoint_display() {
        let err = LedgerError::NonMonotonicCheckpoint {
            current: 100,
            attempted: 90,
        };
        assert_eq!(
            err.to_string(),
            "Non-monotonic checkpoint advance: current 100, attempted 90"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_no_price_display() {
        let err = LedgerError::no_price(53935, "0xabc");
        assert_eq!(err.to_string(), "No price for token 0xabc on chain 53935");
    }

    #[test]
    fn test_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = LedgerError::config("failed to load", Some(Box::new(source)));

        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Configuration error: failed to load");
    }
}
