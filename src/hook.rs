//! Hook registry for breaker transitions and guard rejections.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::FailureKind;
use crate::state::State;

type HookFn = Arc<dyn Fn() + Send + Sync + 'static>;
type TransitionFn = Arc<dyn Fn(State, State) + Send + Sync + 'static>;
type RejectionFn = Arc<dyn Fn(&str, FailureKind) + Send + Sync + 'static>;

/// Callbacks invoked on guard events.
///
/// Hooks run on the calling thread after the guard released its internal
/// locks, so a hook may query the guard that fired it.
pub struct HookRegistry {
    on_open: RwLock<Option<HookFn>>,
    on_close: RwLock<Option<HookFn>>,
    on_half_open: RwLock<Option<HookFn>>,
    on_transition: RwLock<Option<TransitionFn>>,
    on_rejected: RwLock<Option<RejectionFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_open: RwLock::new(None),
            on_close: RwLock::new(None),
            on_half_open: RwLock::new(None),
            on_transition: RwLock::new(None),
            on_rejected: RwLock::new(None),
        }
    }

    /// Sets the hook to call when the circuit breaker opens.
    pub fn set_on_open<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the circuit breaker closes.
    pub fn set_on_close<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the circuit breaker half-opens.
    pub fn set_on_half_open<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_half_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call on every transition with `(from, to)`.
    pub fn set_on_transition<F>(&self, f: F)
    where
        F: Fn(State, State) + Send + Sync + 'static,
    {
        *self.on_transition.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call with `(guard name, kind)` whenever a guard refuses a call.
    pub fn set_on_rejected<F>(&self, f: F)
    where
        F: Fn(&str, FailureKind) + Send + Sync + 'static,
    {
        *self.on_rejected.write() = Some(Arc::new(f));
    }

    /// Executes the hooks registered for a state transition.
    pub fn execute_state_transition_hook(&self, from: State, to: State) {
        // Clone out of the lock so a hook can re-register hooks.
        let specific = match to {
            State::Open => self.on_open.read().clone(),
            State::Closed => self.on_close.read().clone(),
            State::HalfOpen => self.on_half_open.read().clone(),
        };
        if let Some(hook) = specific {
            hook();
        }
        let general = self.on_transition.read().clone();
        if let Some(hook) = general {
            hook(from, to);
        }
    }

    /// Executes the rejection hook.
    pub fn execute_rejection_hook(&self, name: &str, kind: FailureKind) {
        let hook = self.on_rejected.read().clone();
        if let Some(hook) = hook {
            hook(name, kind);
        }
    }
}
