//! Error types shared by every guard.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of a guarded call: the value, or exactly one tagged failure.
pub type Outcome<T, E> = Result<T, GuardError<E>>;

/// Why a guarded call did not produce a value.
///
/// The first four variants are rejections raised by a guard before or instead
/// of the call; `Upstream` carries the call's own failure.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The rate limiter had no permit for this key within its wait budget.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The bulkhead had no free slot within its wait budget.
    #[error("bulkhead is full")]
    BulkheadFull,

    /// The circuit breaker refused the call.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The call did not finish before its deadline.
    #[error("call timed out")]
    TimedOut,

    /// The protected call itself failed.
    #[error("upstream call failed: {0}")]
    Upstream(#[source] E),
}

/// Fieldless tag for a [`GuardError`], used by hooks, metrics and fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// See [`GuardError::RateLimited`].
    RateLimited,
    /// See [`GuardError::BulkheadFull`].
    BulkheadFull,
    /// See [`GuardError::CircuitOpen`].
    CircuitOpen,
    /// See [`GuardError::TimedOut`].
    TimedOut,
    /// See [`GuardError::Upstream`].
    Upstream,
}

impl FailureKind {
    /// Stable lowercase label for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::BulkheadFull => "bulkhead_full",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::TimedOut => "timed_out",
            FailureKind::Upstream => "upstream",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<E> GuardError<E> {
    /// Returns the tag of this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            GuardError::RateLimited => FailureKind::RateLimited,
            GuardError::BulkheadFull => FailureKind::BulkheadFull,
            GuardError::CircuitOpen => FailureKind::CircuitOpen,
            GuardError::TimedOut => FailureKind::TimedOut,
            GuardError::Upstream(_) => FailureKind::Upstream,
        }
    }

    /// True when a guard refused or cut short the call, false for upstream failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, GuardError::Upstream(_))
    }

    /// Returns the upstream failure, if that is what this is.
    pub fn upstream(&self) -> Option<&E> {
        match self {
            GuardError::Upstream(e) => Some(e),
            _ => None,
        }
    }

    /// Maps the upstream failure type, leaving rejections untouched.
    pub fn map_upstream<F, E2>(self, f: F) -> GuardError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            GuardError::RateLimited => GuardError::RateLimited,
            GuardError::BulkheadFull => GuardError::BulkheadFull,
            GuardError::CircuitOpen => GuardError::CircuitOpen,
            GuardError::TimedOut => GuardError::TimedOut,
            GuardError::Upstream(e) => GuardError::Upstream(f(e)),
        }
    }
}

/// Invalid construction-time configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A count that must be at least one was zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    /// A rate threshold was outside `(0, 1]`.
    #[error("`{name}` must be within (0, 1], got {value}")]
    RateOutOfRange {
        /// Field name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// A duration that must be non-zero was zero.
    #[error("`{0}` must be a non-zero duration")]
    ZeroDuration(&'static str),

    /// A pipeline was given two guards of the same kind.
    #[error("pipeline already has a {0} guard")]
    DuplicateGuard(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn upstream_keeps_its_source() {
        let err: GuardError<Boom> = GuardError::Upstream(Boom);
        assert_eq!(err.kind(), FailureKind::Upstream);
        assert!(!err.is_rejection());
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "upstream call failed: boom");
    }

    #[test]
    fn rejections_have_no_source() {
        let errs: [GuardError<Boom>; 4] = [
            GuardError::RateLimited,
            GuardError::BulkheadFull,
            GuardError::CircuitOpen,
            GuardError::TimedOut,
        ];
        for err in errs {
            assert!(err.is_rejection());
            assert!(err.source().is_none());
            assert!(err.upstream().is_none());
        }
    }

    #[test]
    fn map_upstream_only_touches_upstream() {
        let err: GuardError<Boom> = GuardError::Upstream(Boom);
        let mapped = err.map_upstream(|b| b.to_string());
        assert_eq!(mapped.upstream().map(String::as_str), Some("boom"));

        let open: GuardError<Boom> = GuardError::CircuitOpen;
        assert_eq!(open.map_upstream(|_| 0u8).kind(), FailureKind::CircuitOpen);
    }
}
