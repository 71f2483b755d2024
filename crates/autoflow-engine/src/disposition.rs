//! Per-(packet, type) decoration slots (component C3).
//!
//! ```text
//! EMPTY ── checkout ──▶ CHECKED_OUT ── ready(true)  ──▶ SATISFIED
//!                     └ ready(false) ──▶ UNSATISFIABLE
//! EMPTY ── decorate_immediate ─▶ IMMEDIATE ─ (scope end) ─▶ UNSATISFIABLE
//! EMPTY ── unsatisfiable()  ─▶ UNSATISFIABLE
//! ```
//! `reset` returns every field to `Empty`.

use std::any::Any;
use std::sync::Arc;

use crate::error::EngineError;
use crate::sat_counter::SatCounter;
use crate::type_key::TypeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecorationState {
    Empty,
    CheckedOut,
    Satisfied,
    Immediate,
    Unsatisfiable,
}

/// Index of a [`SatCounter`] within [`crate::packet::AutoPacket::sat_counters`].
pub(crate) type SatCounterIndex = usize;

/// Slot tracking everything known about one decoration type on one packet.
pub(crate) struct DecorationDisposition {
    pub(crate) state: DecorationState,
    pub(crate) value: Option<Arc<dyn Any + Send + Sync>>,
    /// Subscribers as `(index into the packet's sat_counters, required)`.
    pub(crate) subscribers: Vec<(SatCounterIndex, bool)>,
    /// At most one publisher; a second is a wiring error.
    pub(crate) publisher: Option<SatCounterIndex>,
    pub(crate) was_checked_out: bool,
}

impl DecorationDisposition {
    pub(crate) fn new() -> Self {
        DecorationDisposition {
            state: DecorationState::Empty,
            value: None,
            subscribers: Vec::new(),
            publisher: None,
            was_checked_out: false,
        }
    }

    /// Returns all fields that change per-generation to their defaults,
    /// preserving the wiring (`subscribers`/`publisher`) which is rebuilt
    /// only at construction / `AddRecipient` / `Finalize` teardown time.
    pub(crate) fn reset(&mut self) {
        self.state = DecorationState::Empty;
        self.value = None;
        self.was_checked_out = false;
    }

    pub(crate) fn is_satisfied(&self) -> bool {
        matches!(
            self.state,
            DecorationState::Satisfied | DecorationState::Immediate
        )
    }

    pub(crate) fn register_subscriber(&mut self, index: SatCounterIndex, required: bool) {
        self.subscribers.push((index, required));
    }

    pub(crate) fn register_publisher(
        &mut self,
        index: SatCounterIndex,
        key: &TypeKey,
    ) -> Result<(), EngineError> {
        if self.publisher.is_some() {
            return Err(EngineError::duplicate_publisher(key));
        }
        self.publisher = Some(index);
        Ok(())
    }

    pub(crate) fn begin_checkout(
        &mut self,
        key: &TypeKey,
        value: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), EngineError> {
        match self.state {
            DecorationState::Empty => {
                self.state = DecorationState::CheckedOut;
                self.was_checked_out = true;
                self.value = Some(value);
                Ok(())
            }
            DecorationState::CheckedOut => Err(EngineError::already_checked_out(key)),
            _ => Err(EngineError::already_present(key)),
        }
    }

    pub(crate) fn complete_checkout(&mut self, ready: bool) {
        debug_assert_eq!(self.state, DecorationState::CheckedOut);
        if ready {
            self.state = DecorationState::Satisfied;
        } else {
            self.value = None;
            self.state = DecorationState::Unsatisfiable;
        }
    }

    pub(crate) fn begin_immediate(
        &mut self,
        key: &TypeKey,
        value: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), EngineError> {
        if self.was_checked_out {
            return Err(EngineError::already_checked_out(key));
        }
        self.state = DecorationState::Immediate;
        self.was_checked_out = true;
        self.value = Some(value);
        Ok(())
    }

    pub(crate) fn end_immediate(&mut self) {
        self.value = None;
        self.state = DecorationState::Unsatisfiable;
    }

    pub(crate) fn mark_unsatisfiable(&mut self, key: &TypeKey) -> Result<(), EngineError> {
        if self.was_checked_out {
            return Err(EngineError::already_present(key));
        }
        self.state = DecorationState::Unsatisfiable;
        self.was_checked_out = true;
        Ok(())
    }

    pub(crate) fn remove_subscriber_lifo(&mut self, index: SatCounterIndex) {
        let last = self.subscribers.pop();
        debug_assert!(
            last.map(|(i, _)| i == index).unwrap_or(false),
            "per-packet recipients must be removed in LIFO order"
        );
    }

    pub(crate) fn clear_publisher(&mut self, index: SatCounterIndex) {
        if self.publisher == Some(index) {
            self.publisher = None;
        }
    }
}

/// `Decrement`-the-right-subscribers helper shared by `UpdateSatisfaction`
/// and `MarkUnsatisfiable`. Kept here (rather than in `packet.rs`) because
/// it only needs the disposition's subscriber list and a slice of counters.
pub(crate) fn decrement_subscribers(
    subscribers: &[(SatCounterIndex, bool)],
    counters: &mut [SatCounter],
    only_optional: bool,
    queue: &mut Vec<SatCounterIndex>,
) {
    for &(index, required) in subscribers {
        if only_optional && required {
            // Required subscribers of an unsatisfiable type never run.
            continue;
        }
        if counters[index].decrement(required) {
            queue.push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TypeKey {
        TypeKey::of::<u32>()
    }

    #[test]
    fn checkout_then_ready_transitions_to_satisfied() {
        let mut d = DecorationDisposition::new();
        d.begin_checkout(&key(), Arc::new(7u32)).unwrap();
        assert_eq!(d.state, DecorationState::CheckedOut);
        d.complete_checkout(true);
        assert!(d.is_satisfied());
    }

    #[test]
    fn double_checkout_is_an_error() {
        let mut d = DecorationDisposition::new();
        d.begin_checkout(&key(), Arc::new(7u32)).unwrap();
        assert!(d.begin_checkout(&key(), Arc::new(8u32)).is_err());
    }

    #[test]
    fn checkout_after_satisfied_is_already_present() {
        let mut d = DecorationDisposition::new();
        d.begin_checkout(&key(), Arc::new(7u32)).unwrap();
        d.complete_checkout(true);
        let err = d.begin_checkout(&key(), Arc::new(8u32)).unwrap_err();
        assert_eq!(err, EngineError::already_present(&key()));
    }

    #[test]
    fn unsatisfiable_after_checked_out_is_rejected() {
        let mut d = DecorationDisposition::new();
        d.begin_checkout(&key(), Arc::new(1u32)).unwrap();
        d.complete_checkout(false);
        assert!(d.mark_unsatisfiable(&key()).is_err());
    }

    #[test]
    fn reset_returns_to_empty() {
        let mut d = DecorationDisposition::new();
        d.begin_checkout(&key(), Arc::new(1u32)).unwrap();
        d.complete_checkout(true);
        d.reset();
        assert_eq!(d.state, DecorationState::Empty);
        assert!(d.value.is_none());
        assert!(!d.was_checked_out);
    }

    #[test]
    fn duplicate_publisher_is_rejected() {
        let mut d = DecorationDisposition::new();
        d.register_publisher(0, &key()).unwrap();
        assert!(d.register_publisher(1, &key()).is_err());
    }
}
