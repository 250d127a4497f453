//! Edge-tier admission: bearer-token checks and path-keyed request gating.
//!
//! The transport layer hands each request's path and headers to an
//! [`EdgeChain`] and either forwards the request or writes the returned
//! [`EdgeResponse`].

use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{AuthConfig, PathGateConfig};
use crate::error::ConfigError;
use crate::response::EdgeResponse;

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    start: Instant,
}

/// Fixed-window request counter keyed by request path.
///
/// A path's counter restarts once more than one window has passed since its
/// window began. A request is refused when it would push the counter past
/// the path's limit. Limits come from the longest configured prefix of the
/// path, or the default limit when none matches.
///
/// Every distinct path seen keeps one entry in the gate's map. Entries are
/// reset in place when their window lapses but are never evicted, so callers
/// should feed it normalized paths rather than raw, unbounded URLs.
pub struct PathRateGate {
    config: PathGateConfig,
    windows: Mutex<AHashMap<String, Window>>,
}

impl PathRateGate {
    /// Creates a gate after validating `config`.
    pub fn new(config: PathGateConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            windows: Mutex::new(AHashMap::new()),
        })
    }

    /// The configuration this gate was built with.
    pub fn config(&self) -> &PathGateConfig {
        &self.config
    }

    /// Limit applied to `path`.
    pub fn limit_for(&self, path: &str) -> u64 {
        self.config
            .path_limits
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.config.default_limit, |(_, limit)| *limit)
    }

    /// Counts a request for `path` and reports whether it is admitted.
    pub fn allow(&self, path: &str) -> bool {
        self.allow_at(path, Instant::now())
    }

    fn allow_at(&self, path: &str, now: Instant) -> bool {
        let limit = self.limit_for(path);
        let window = self.config.window;

        let count = {
            let mut windows = self.windows.lock();
            let entry = windows.entry(path.to_owned()).or_insert(Window {
                count: 0,
                start: now,
            });
            if now.saturating_duration_since(entry.start) > window {
                entry.count = 0;
                entry.start = now;
            }
            entry.count += 1;
            entry.count
        };

        if count > limit {
            warn!(path, limit, window = ?window, "path rate exceeded");
            return false;
        }
        true
    }

    /// Requests counted for `path` in its current window.
    pub fn current_count(&self, path: &str) -> u64 {
        let now = Instant::now();
        match self.windows.lock().get(path) {
            Some(w) if now.saturating_duration_since(w.start) <= self.config.window => w.count,
            _ => 0,
        }
    }

    /// Number of distinct paths tracked.
    pub fn path_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Length of one counting window.
    pub fn window(&self) -> Duration {
        self.config.window
    }
}

impl std::fmt::Debug for PathRateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRateGate")
            .field("config", &self.config)
            .field("paths", &self.windows.lock().len())
            .finish()
    }
}

/// Checks the `Authorization` header of non-public requests.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthFilter {
    config: AuthConfig,
}

impl TokenAuthFilter {
    /// Creates a filter.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Whether `path` skips the token check.
    pub fn is_public(&self, path: &str) -> bool {
        self.config
            .public_markers
            .iter()
            .any(|marker| path.contains(marker.as_str()))
    }

    /// Returns the 401 response for a refused request, or `None` to continue.
    pub fn check(&self, path: &str, authorization: Option<&str>) -> Option<EdgeResponse> {
        if self.is_public(path) {
            return None;
        }

        let reason = match authorization {
            None => "missing token",
            Some(value) => match value.strip_prefix(BEARER_PREFIX) {
                None => "malformed token",
                Some(token) if self.config.denied_tokens.iter().any(|t| t == token) => {
                    "invalid token"
                }
                Some(_) => return None,
            },
        };

        warn!(path, reason, "request refused");
        Some(EdgeResponse::unauthorized(reason))
    }
}

/// What the transport should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeDecision {
    /// Forward the request.
    Continue,
    /// Write this response and stop.
    Respond(EdgeResponse),
}

impl EdgeDecision {
    /// Whether the request may be forwarded.
    pub fn is_continue(&self) -> bool {
        matches!(self, EdgeDecision::Continue)
    }
}

/// Runs authentication and then the path gate.
///
/// Refused requests are not counted against the path limit.
#[derive(Debug)]
pub struct EdgeChain {
    auth: Option<TokenAuthFilter>,
    gate: Option<PathRateGate>,
}

impl EdgeChain {
    /// A chain with neither check.
    pub fn new() -> Self {
        Self {
            auth: None,
            gate: None,
        }
    }

    /// Adds the token check.
    pub fn with_auth(mut self, auth: TokenAuthFilter) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Adds the path gate.
    pub fn with_gate(mut self, gate: PathRateGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The path gate, if configured.
    pub fn gate(&self) -> Option<&PathRateGate> {
        self.gate.as_ref()
    }

    /// Decides on a request. Header names are matched case-insensitively.
    pub fn handle(&self, path: &str, headers: &[(&str, &str)]) -> EdgeDecision {
        if let Some(auth) = &self.auth {
            let authorization = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
                .map(|(_, value)| *value);
            if let Some(response) = auth.check(path, authorization) {
                return EdgeDecision::Respond(response);
            }
        }

        if let Some(gate) = &self.gate {
            if !gate.allow(path) {
                return EdgeDecision::Respond(EdgeResponse::too_many_requests());
            }
        }

        debug!(path, "request admitted");
        EdgeDecision::Continue
    }
}

impl Default for EdgeChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(default_limit: u64, window: Duration) -> PathRateGate {
        PathRateGate::new(PathGateConfig {
            window,
            default_limit,
            path_limits: vec![
                ("/provider1".to_string(), 3),
                ("/provider1/api".to_string(), 2),
            ],
        })
        .unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let gate = gate(10, Duration::from_secs(60));
        assert_eq!(gate.limit_for("/provider1/api/users"), 2);
        assert_eq!(gate.limit_for("/provider1/health"), 3);
        assert_eq!(gate.limit_for("/other"), 10);
    }

    #[test]
    fn default_limits_match_deployment() {
        let gate = PathRateGate::new(PathGateConfig::default()).unwrap();
        assert_eq!(gate.limit_for("/provider1/api/hello"), 50);
        assert_eq!(gate.limit_for("/provider2/api/hello"), 80);
        assert_eq!(gate.limit_for("/"), 100);
    }

    #[test]
    fn rejects_past_limit_then_resets() {
        let gate = gate(10, Duration::from_millis(50));
        let start = Instant::now();
        assert!(gate.allow_at("/provider1/api/x", start));
        assert!(gate.allow_at("/provider1/api/x", start));
        assert!(!gate.allow_at("/provider1/api/x", start));
        // Other paths keep their own counters.
        assert!(gate.allow_at("/provider1/api/y", start));

        let later = start + Duration::from_millis(51);
        assert!(gate.allow_at("/provider1/api/x", later));
    }

    #[test]
    fn lapsed_paths_keep_their_entry() {
        let gate = gate(10, Duration::from_millis(50));
        let start = Instant::now();
        for path in ["/a", "/b", "/a", "/c"] {
            assert!(gate.allow_at(path, start));
        }
        assert_eq!(gate.path_count(), 3);

        let later = start + Duration::from_millis(120);
        assert!(gate.allow_at("/a", later));
        assert_eq!(gate.path_count(), 3);
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = PathGateConfig {
            window: Duration::ZERO,
            ..PathGateConfig::default()
        };
        assert!(matches!(
            PathRateGate::new(config),
            Err(ConfigError::ZeroDuration("window"))
        ));
    }

    #[test]
    fn auth_outcomes() {
        let auth = TokenAuthFilter::default();
        assert!(auth.check("/api/public/info", None).is_none());
        assert!(auth.check("/open/ping", None).is_none());
        assert!(auth.check("/api/x", Some("Bearer good")).is_none());

        let cases = [
            (None, "missing token"),
            (Some("Basic abc"), "malformed token"),
            (Some("Bearer invalid-token"), "invalid token"),
        ];
        for (header, message) in cases {
            let response = auth.check("/api/x", header).unwrap();
            assert_eq!(response.code, 401);
            assert_eq!(response.message, message);
        }
    }

    #[test]
    fn chain_checks_auth_before_counting() {
        let chain = EdgeChain::new()
            .with_auth(TokenAuthFilter::default())
            .with_gate(gate(1, Duration::from_secs(60)));

        let refused = chain.handle("/svc", &[]);
        assert!(matches!(refused, EdgeDecision::Respond(ref r) if r.code == 401));
        assert_eq!(chain.gate().unwrap().current_count("/svc"), 0);

        let headers = [("authorization", "Bearer ok")];
        assert!(chain.handle("/svc", &headers).is_continue());
        let limited = chain.handle("/svc", &headers);
        assert!(matches!(limited, EdgeDecision::Respond(ref r) if r.code == 429));
    }
}
