//! Hash-based backend selection.

use std::fs;
use std::hash::Hash;

use ahash::RandomState;
use once_cell::sync::Lazy;
use tracing::debug;

/// Identity used when the host name cannot be resolved.
pub const FALLBACK_IDENTITY: &str = "default-host";

static LOCAL_IDENTITY: Lazy<String> = Lazy::new(resolve_host_name);

// Fixed seeds keep the mapping identical across processes built from the same binary.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Picks one backend per caller identity by hashing the identity modulo the
/// backend count.
///
/// The mapping is stable for a fixed identity and a fixed backend ordering.
/// It is not consistent hashing: adding, removing or reordering backends may
/// move identities that were not directly affected.
///
/// # Example
///
/// ```
/// use callguard::DeterministicSelector;
///
/// let selector = DeterministicSelector::new();
/// let backends = ["b1", "b2", "b3"];
/// let first = selector.select("host-A", &backends);
/// assert_eq!(first, selector.select("host-A", &backends));
/// ```
#[derive(Clone)]
pub struct DeterministicSelector {
    hasher: RandomState,
}

impl DeterministicSelector {
    /// Creates a selector with the fixed seeds.
    pub fn new() -> Self {
        Self {
            hasher: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    /// Index into a list of `len` backends for `identity`, or `None` when `len` is zero.
    pub fn index_for<I: Hash + ?Sized>(&self, identity: &I, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let hash = self.hasher.hash_one(identity);
        // Both operands fit in u64, and the remainder is below `len`.
        Some((hash % len as u64) as usize)
    }

    /// Returns the backend assigned to `identity`, or `None` for an empty list.
    pub fn select<'a, I, B>(&self, identity: &I, backends: &'a [B]) -> Option<&'a B>
    where
        I: Hash + ?Sized,
    {
        let index = self.index_for(identity, backends.len())?;
        debug!(index, backends = backends.len(), "backend selected");
        backends.get(index)
    }

    /// Selects using this process's [`local_identity`](Self::local_identity).
    pub fn select_local<'a, B>(&self, backends: &'a [B]) -> Option<&'a B> {
        self.select(Self::local_identity(), backends)
    }

    /// Host name of the running process, resolved once.
    ///
    /// Reads `HOSTNAME`, then `/etc/hostname`, and falls back to
    /// [`FALLBACK_IDENTITY`].
    pub fn local_identity() -> &'static str {
        LOCAL_IDENTITY.as_str()
    }
}

impl Default for DeterministicSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeterministicSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicSelector").finish_non_exhaustive()
    }
}

fn resolve_host_name() -> String {
    let from_env = std::env::var("HOSTNAME").ok();
    let from_file = || fs::read_to_string("/etc/hostname").ok();

    from_env
        .or_else(from_file)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            debug!(identity = FALLBACK_IDENTITY, "host name unavailable");
            FALLBACK_IDENTITY.to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_identity_same_backend() {
        let selector = DeterministicSelector::new();
        let backends = ["b1", "b2", "b3"];
        let first = selector.select("host-A", &backends);
        assert!(first.is_some());
        for _ in 0..100 {
            assert_eq!(selector.select("host-A", &backends), first);
        }
    }

    #[test]
    fn separate_selectors_agree() {
        let backends = ["b1", "b2", "b3", "b4", "b5"];
        let a = DeterministicSelector::new();
        let b = DeterministicSelector::default();
        for host in ["alpha", "beta", "gamma", "delta"] {
            assert_eq!(a.select(host, &backends), b.select(host, &backends));
        }
    }

    #[test]
    fn empty_backends_select_nothing() {
        let selector = DeterministicSelector::new();
        let none: [&str; 0] = [];
        assert_eq!(selector.select("host-A", &none), None);
        assert_eq!(selector.index_for("host-A", 0), None);
    }

    #[test]
    fn local_identity_is_never_empty() {
        let identity = DeterministicSelector::local_identity();
        assert!(!identity.is_empty());
        assert_eq!(identity, DeterministicSelector::local_identity());
        assert!(DeterministicSelector::new().select_local(&[1, 2]).is_some());
    }

    proptest! {
        #[test]
        fn index_is_in_range_and_repeatable(identity in ".*", len in 1usize..64) {
            let selector = DeterministicSelector::new();
            let index = selector.index_for(identity.as_str(), len).unwrap();
            prop_assert!(index < len);
            prop_assert_eq!(Some(index), selector.index_for(identity.as_str(), len));
        }
    }
}
