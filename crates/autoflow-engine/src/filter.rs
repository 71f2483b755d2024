//! Filter descriptors: the external-facing capability the engine dispatches
//! to (component C1). Reflection over a callable's parameter list is an
//! out-of-scope collaborator; callers build a [`FilterDescriptor`]
//! explicitly, either by hand or via a caller-supplied builder layered on
//! top.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::packet::AutoPacket;
use crate::type_key::TypeKey;

/// How a single filter input participates in satisfaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Must become satisfied before the filter can run.
    Required,
    /// Does not block invocation; resolved (one way or another) at
    /// finalize time if never satisfied during the packet's lifetime.
    Optional,
    /// Declares this filter as the publisher of a decoration type.
    OutRef,
    /// Same as `OutRef`, but additionally eligible to auto-ready (reserved
    /// for builders layered on top of this engine; the dispatch core treats
    /// it identically to `OutRef`).
    OutRefAutoReady,
}

impl InputKind {
    pub(crate) fn is_output(self) -> bool {
        matches!(self, InputKind::OutRef | InputKind::OutRefAutoReady)
    }
}

/// One entry in a filter's input signature.
#[derive(Debug, Clone)]
pub struct FilterInput {
    pub type_key: TypeKey,
    pub kind: InputKind,
}

impl FilterInput {
    pub fn required(type_key: TypeKey) -> Self {
        FilterInput { type_key, kind: InputKind::Required }
    }

    pub fn optional(type_key: TypeKey) -> Self {
        FilterInput { type_key, kind: InputKind::Optional }
    }

    pub fn out_ref(type_key: TypeKey) -> Self {
        FilterInput { type_key, kind: InputKind::OutRef }
    }

    pub fn out_ref_auto_ready(type_key: TypeKey) -> Self {
        FilterInput { type_key, kind: InputKind::OutRefAutoReady }
    }
}

/// A unique, orderable identity for a registered filter, used for
/// stable-sort + dedup across a container's merged factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId(u64);

impl FilterId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FilterId(COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// Immutable record of a registered filter: its ordered input signature and
/// the invoker that runs it against a packet's current decorations.
pub struct FilterDescriptor {
    id: FilterId,
    name: &'static str,
    inputs: Vec<FilterInput>,
    deferred: bool,
    invoke: Arc<dyn Fn(&AutoPacket) + Send + Sync>,
}

impl FilterDescriptor {
    /// Builds a descriptor from an explicit input list and invoker.
    ///
    /// `deferred` filters are excluded from `DecorateImmediate`'s
    /// satisfaction pulse because an immediate decoration is
    /// gone again by the time a deferred call could observe it.
    pub fn new(
        name: &'static str,
        inputs: Vec<FilterInput>,
        deferred: bool,
        invoke: impl Fn(&AutoPacket) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(FilterDescriptor {
            id: FilterId::next(),
            name,
            inputs,
            deferred,
            invoke: Arc::new(invoke),
        })
    }

    pub fn id(&self) -> FilterId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inputs(&self) -> &[FilterInput] {
        &self.inputs
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub(crate) fn invoke(&self, packet: &AutoPacket) {
        (self.invoke)(packet)
    }
}

impl fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("deferred", &self.deferred)
            .finish()
    }
}

impl PartialEq for FilterDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for FilterDescriptor {}

impl PartialOrd for FilterDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FilterDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for FilterDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_get_distinct_ids() {
        let a = FilterDescriptor::new("a", vec![], false, |_p| {});
        let b = FilterDescriptor::new("b", vec![], false, |_p| {});
        assert_ne!(a.id(), b.id());
        assert!(a < b || b < a);
    }

    #[test]
    fn output_kind_classification() {
        assert!(InputKind::OutRef.is_output());
        assert!(InputKind::OutRefAutoReady.is_output());
        assert!(!InputKind::Required.is_output());
        assert!(!InputKind::Optional.is_output());
    }
}
