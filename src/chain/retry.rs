//! Retry policy and RPC error classification.
//!
//! Every chain call is wrapped by an exponential back-off policy: initial
//! delay 250 ms, doubling per attempt, capped at 30 s, at most 8 attempts.
//! Only transient failures are retried; permanent failures propagate
//! immediately, and "range too wide" responses are handed back to the
//! indexer so it can halve its batch before asking again.

use std::time::Duration;

use crate::error::{LedgerError, RpcErrorKind};

/// Maximum retry attempts before a transient failure is surfaced.
pub const MAX_ATTEMPTS: u32 = 8;

/// Per-call deadline applied on top of the retry policy.
pub const CALL_DEADLINE: Duration = Duration::from_secs(15);

/// Exponential back-off schedule for transient RPC failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    initial: Duration,
    factor: u32,
    cap: Duration,
}

impl RetryPolicy {
    /// The standard policy: 250 ms initial, x2, capped at 30 s.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            initial: Duration::from_millis(250),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }

    /// Delay before the given (1-indexed) retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.cap {
                return self.cap;
            }
        }
        delay.min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Classify a raw RPC failure message into a retry decision.
///
/// Endpoints differ in how they phrase their limits; the indexer must not
/// assume a specific log-range cap, so the classifier matches the common
/// phrasings and defaults unknown failures to transient.
#[must_use]
pub fn classify_rpc_failure(message: &str) -> RpcErrorKind {
    let lower = message.to_lowercase();

    // Log-range caps: the batch is halved and the query retried.
    if lower.contains("too large")
        || lower.contains("too many results")
        || lower.contains("block range")
        || lower.contains("query returned more than")
        || lower.contains("exceed maximum block range")
    {
        return RpcErrorKind::RangeTooWide;
    }

    // Caller bugs: never retried.
    if lower.contains("invalid argument")
        || lower.contains("invalid params")
        || lower.contains("method not found")
        || lower.contains("invalid address")
    {
        return RpcErrorKind::Permanent;
    }

    RpcErrorKind::Transient
}

/// Wrap a transport-level failure into a [`LedgerError`] with classification.
#[must_use]
pub fn rpc_error(operation: &str, message: String) -> LedgerError {
    match classify_rpc_failure(&message) {
        RpcErrorKind::RangeTooWide => {
            LedgerError::rpc_range_too_wide(format!("{operation}: {message}"))
        }
        RpcErrorKind::Permanent => {
            LedgerError::rpc_permanent(format!("{operation}: {message}"), None)
        }
        RpcErrorKind::Transient => {
            LedgerError::rpc_transient(format!("{operation}: {message}"), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_caps_at_thirty_seconds() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(32), Duration::from_secs(30));
    }

    #[test]
    fn test_classify_range_too_wide() {
        assert_eq!(
            classify_rpc_failure("query returned more than 10000 results"),
            RpcErrorKind::RangeTooWide
        );
        assert_eq!(
            classify_rpc_failure("eth_getLogs block range is too large"),
            RpcErrorKind::RangeTooWide
        );
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(
            classify_rpc_failure("invalid argument 0: json: cannot unmarshal"),
            RpcErrorKind::Permanent
        );
        assert_eq!(
            classify_rpc_failure("method not found"),
            RpcErrorKind::Permanent
        );
    }

    #[test]
    fn test_unknown_failures_default_to_transient() {
        assert_eq!(
            classify_rpc_failure("connection reset by peer"),
            RpcErrorKind::Transient
        );
        assert_eq!(classify_rpc_failure("503 service unavailable"), RpcErrorKind::Transient);
    }
}
