//! Per-(packet, filter) satisfaction tracking (component C2).

use std::sync::Arc;

use crate::filter::{FilterDescriptor, FilterId, InputKind};

/// Tracks how many of a filter's required/optional inputs remain
/// unresolved for one packet, plus the one-shot "already called" guard.
pub(crate) struct SatCounter {
    descriptor: Arc<FilterDescriptor>,
    required_total: u32,
    optional_total: u32,
    remaining: u32,
    optional_remaining: u32,
    called: bool,
}

impl SatCounter {
    pub(crate) fn new(descriptor: Arc<FilterDescriptor>) -> Self {
        let required_total = descriptor
            .inputs()
            .iter()
            .filter(|i| i.kind == InputKind::Required)
            .count() as u32;
        let optional_total = descriptor
            .inputs()
            .iter()
            .filter(|i| i.kind == InputKind::Optional)
            .count() as u32;
        SatCounter {
            descriptor,
            required_total,
            optional_total,
            remaining: required_total,
            optional_remaining: optional_total,
            called: false,
        }
    }

    pub(crate) fn descriptor(&self) -> &Arc<FilterDescriptor> {
        &self.descriptor
    }

    pub(crate) fn id(&self) -> FilterId {
        self.descriptor.id()
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.descriptor.is_deferred()
    }

    /// Restores counters to "freshly reset" and clears the call guard.
    pub(crate) fn reset(&mut self) {
        self.remaining = self.required_total;
        self.optional_remaining = self.optional_total;
        self.called = false;
    }

    /// True iff this filter has no inputs at all blocking it right now
    /// (all required inputs already resolved) and it has not yet run.
    pub(crate) fn is_ready_to_call(&self) -> bool {
        self.remaining == 0 && !self.called
    }

    /// Claims the "already ready" transition for a counter that starts (or
    /// becomes) unblocked outside of `decrement`/`resolve` — zero-required-input
    /// filters at `initialize`/`add_recipient` time. Sets `called` on the same
    /// transition those two methods do, so this can never double-fire a
    /// filter alongside a later `decrement`/`resolve` call.
    pub(crate) fn mark_called_if_ready(&mut self) -> bool {
        self.maybe_mark_called()
    }

    /// Decrements the appropriate counter. Returns `true` exactly on the
    /// transition that makes the filter runnable; sets `called` on that
    /// transition so a later transition can never re-fire it.
    pub(crate) fn decrement(&mut self, required: bool) -> bool {
        if required {
            self.remaining = self.remaining.saturating_sub(1);
        } else {
            self.optional_remaining = self.optional_remaining.saturating_sub(1);
        }
        self.maybe_mark_called()
    }

    /// Finalize-time hook: collapses all remaining optionals to resolved.
    /// Returns `true` if this transition unblocks the filter.
    pub(crate) fn resolve(&mut self) -> bool {
        self.optional_remaining = 0;
        self.maybe_mark_called()
    }

    /// Bypasses the one-shot guard to offer a one-shot pulse window
    /// (`PulseSatisfaction`). Caller is responsible for
    /// restoring `remaining` afterwards via [`Self::undo_pulse_decrement`].
    pub(crate) fn pulse_decrement(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0 && !self.called
    }

    /// Undoes a single `pulse_decrement`, without touching `called`.
    pub(crate) fn undo_pulse_decrement(&mut self) {
        self.remaining += 1;
    }

    fn maybe_mark_called(&mut self) -> bool {
        if self.remaining == 0 && !self.called {
            self.called = true;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterInput;
    use crate::type_key::TypeKey;

    fn descriptor(required: usize, optional: usize) -> Arc<FilterDescriptor> {
        let mut inputs = Vec::new();
        for _ in 0..required {
            inputs.push(FilterInput::required(TypeKey::of::<u32>()));
        }
        for _ in 0..optional {
            inputs.push(FilterInput::optional(TypeKey::of::<bool>()));
        }
        FilterDescriptor::new("test", inputs, false, |_p| {})
    }

    #[test]
    fn zero_required_is_ready_immediately() {
        let sc = SatCounter::new(descriptor(0, 2));
        assert!(sc.is_ready_to_call());
    }

    #[test]
    fn decrement_fires_exactly_once() {
        let mut sc = SatCounter::new(descriptor(2, 0));
        assert!(!sc.decrement(true));
        assert!(sc.decrement(true));
        // A further (spurious) decrement must not re-fire.
        assert!(!sc.decrement(true));
    }

    #[test]
    fn resolve_unblocks_only_if_required_already_met() {
        let mut sc = SatCounter::new(descriptor(1, 1));
        assert!(!sc.resolve(), "required input still outstanding");
        assert!(sc.decrement(true));
        // Already called, resolve must not refire.
        assert!(!sc.resolve());
    }

    #[test]
    fn mark_called_if_ready_prevents_a_later_resolve_from_refiring() {
        let mut sc = SatCounter::new(descriptor(0, 1));
        assert!(sc.is_ready_to_call());
        assert!(sc.mark_called_if_ready(), "zero-required counter claims the ready transition");
        // A subsequent finalize-time resolve() must not fire the filter again.
        assert!(!sc.resolve());
    }

    #[test]
    fn pulse_decrement_is_restored() {
        let mut sc = SatCounter::new(descriptor(1, 0));
        assert!(sc.pulse_decrement());
        sc.undo_pulse_decrement();
        // Counter value is restored, and the one-shot guard was never
        // flipped by a pulse, so a real decrement can still fire.
        assert!(sc.decrement(true));
    }

    #[test]
    fn reset_clears_called_guard() {
        let mut sc = SatCounter::new(descriptor(1, 0));
        assert!(sc.decrement(true));
        sc.reset();
        assert!(!sc.called);
        assert_eq!(sc.remaining, 1);
    }
}
