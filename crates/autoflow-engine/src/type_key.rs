//! Runtime type identity used to key decoration slots.
//!
//! A [`TypeKey`] is hashable, totally ordered, and printable, satisfying the
//! type-identity requirement in the engine's external interface. `T` and
//! `Arc<T>` produce distinct keys because they are distinct `TypeId`s — this
//! is how the engine realizes the "by value vs. by shared handle" duality
//! without any unsafe aliasing (see SPEC_FULL.md §3).

use std::any::{type_name, TypeId};
use std::cmp::Ordering;
use std::fmt;

/// A stable, process-local identity for a Rust type.
#[derive(Clone, Copy, Eq)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Returns the key for `T`.
    pub fn of<T: 'static + ?Sized>() -> Self {
        TypeKey {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Diagnostic name suitable for error messages. Not guaranteed unique
    /// across distinct monomorphizations with colliding display names; use
    /// equality, not the name, for identity.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::hash::Hash for TypeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // `TypeId` does not expose a total order on every toolchain this
        // crate targets, so the diagnostic name carries the ordering; the
        // debug rendering of the id breaks ties between types whose
        // `type_name` output happens to collide (e.g. across crate versions).
        self.name
            .cmp(other.name)
            .then_with(|| format!("{:?}", self.id).cmp(&format!("{:?}", other.id)))
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
