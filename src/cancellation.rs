//! Process-scoped cooperative-cancel tokens (spec §4.A).
//!
//! A process-wide keyed set of one-shot cancellation signals, indexed by
//! `process_id`. Signals are edge-triggered and monotonic: once `cancel` is
//! called, `is_cancelled` stays true until `clear`. Grounded on
//! `original_source/src/recipe_flow/cancellation.py`'s module-level
//! `_tokens: Dict[str, asyncio.Event]`; here the dict is behind a `Mutex`
//! (multiple tasks poll and set cancel flags concurrently) and each slot is
//! a plain `AtomicBool` rather than a wakeable `Event`, since handlers only
//! ever poll — nothing awaits a cancellation directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a token exists for `process_id`, without changing its value.
    pub fn register(&self, process_id: Uuid) {
        self.slot(process_id);
    }

    /// Sets the cancel flag for `process_id`, creating the token if absent.
    pub fn cancel(&self, process_id: Uuid) {
        self.slot(process_id).store(true, Ordering::SeqCst);
    }

    /// Non-blocking test of whether `process_id` has been cancelled.
    /// A process with no registered token has never been cancelled.
    pub fn is_cancelled(&self, process_id: Uuid) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&process_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Discards the token for `process_id` (called when a run reaches a
    /// terminal state).
    pub fn clear(&self, process_id: Uuid) {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&process_id);
    }

    fn slot(&self, process_id: Uuid) -> Arc<AtomicBool> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(process_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn unregistered_process_is_not_cancelled() {
        let registry = CancellationRegistry::new();
        assert!(!registry.is_cancelled(Uuid::new_v4()));
    }

    #[test]
    fn cancel_is_visible_without_prior_register() {
        let registry = CancellationRegistry::new();
        let pid = Uuid::new_v4();
        registry.cancel(pid);
        assert!(registry.is_cancelled(pid));
    }

    #[test]
    fn cancel_is_monotonic_until_clear() {
        let registry = CancellationRegistry::new();
        let pid = Uuid::new_v4();
        registry.register(pid);
        assert!(!registry.is_cancelled(pid));
        registry.cancel(pid);
        assert!(registry.is_cancelled(pid));
        assert!(registry.is_cancelled(pid));
        registry.clear(pid);
        assert!(!registry.is_cancelled(pid));
    }

    #[test]
    fn tokens_are_independent_per_process() {
        let registry = CancellationRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.cancel(a);
        assert!(registry.is_cancelled(a));
        assert!(!registry.is_cancelled(b));
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let registry = StdArc::new(CancellationRegistry::new());
        let pid = Uuid::new_v4();
        registry.cancel(pid);
        registry.cancel(pid);
        assert!(registry.is_cancelled(pid));
    }
}
