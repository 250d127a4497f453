//! Uniform response shapes for fallbacks and the edge tier.

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// `{code, message}` pair produced for a guarded call.
///
/// Callers should treat any `code` outside `200..300` as the rejection signal
/// rather than inspecting error types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackResponse {
    /// HTTP-like status code.
    pub code: u16,
    /// Human-readable explanation.
    pub message: String,
}

impl FallbackResponse {
    /// Builds a response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A 200 response.
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(200, message)
    }

    /// Maps every failure kind to its own status and message.
    pub fn from_failure<E: Display>(failure: &GuardError<E>) -> Self {
        match failure {
            GuardError::RateLimited => {
                Self::new(429, "rate limiter: request rate too high, please retry later")
            }
            GuardError::BulkheadFull => {
                Self::new(429, "bulkhead: too many concurrent requests, please retry later")
            }
            GuardError::CircuitOpen => {
                Self::new(503, "circuit breaker open: service temporarily unavailable")
            }
            GuardError::TimedOut => Self::new(408, "request timed out"),
            GuardError::Upstream(e) => Self::new(500, format!("upstream call failed: {e}")),
        }
    }

    /// Whether `code` is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Terminal `{code, message, timestamp}` response written by the edge tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeResponse {
    /// HTTP status code.
    pub code: u16,
    /// Human-readable explanation.
    pub message: String,
    /// Milliseconds since the Unix epoch when the response was built.
    pub timestamp: u64,
}

impl EdgeResponse {
    /// Builds a response stamped with the current time.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: epoch_millis(),
        }
    }

    /// 401 with `message`.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    /// 429 for an exceeded path limit.
    pub fn too_many_requests() -> Self {
        Self::new(429, "request rate exceeded, please retry later")
    }

    /// 503 served when a routed service is unavailable.
    pub fn service_unavailable() -> Self {
        Self::new(503, "service temporarily unavailable, please retry later")
    }

    /// Serializes to the JSON body written to the client.
    pub fn to_json(&self) -> String {
        // Serializing plain integers and strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
