//! Structured error kinds produced by the dispatch engine.
//!
//! Every fallible engine operation returns `Result<_, EngineError>` rather
//! than panicking; only a filter's own invoker body is allowed to panic, and
//! the engine never catches that panic (see SPEC_FULL.md §4 notes).

use crate::type_key::TypeKey;
use thiserror::Error;

/// Failure modes of the dispatch engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `NewPacket` called before `Start` or after `Stop`.
    #[error("cannot create a packet: factory is not running")]
    NotRunning,

    /// `Initialize` could not take the outstanding handle because the
    /// enclosing container has already expired.
    #[error("cannot initialize packet: enclosing context has already expired")]
    ContainerExpired,

    /// Two filters declared an output for the same decoration type within
    /// the same factory, or a second `Checkout` raced the first.
    #[error("decoration `{0}` already has a publisher registered")]
    DuplicatePublisher(&'static str),

    /// `Checkout` on a slot that is already `Satisfied`, or `Unsatisfiable`
    /// on a slot that was ever checked out.
    #[error("decoration `{0}` is already present on this packet")]
    AlreadyPresent(&'static str),

    /// `Checkout` on a slot that is currently checked out elsewhere, or
    /// `DecorateImmediate` on a slot that was ever checked out.
    #[error("decoration `{0}` is already checked out")]
    AlreadyCheckedOut(&'static str),

    /// `Get::<T>()` (the non-out-param form) found no value.
    #[error("decoration `{0}` is missing from this packet")]
    DecorationMissing(&'static str),

    /// `Checkout` was given an explicit but empty owning handle.
    #[error("cannot check out decoration `{0}` with a null handle")]
    NullHandle(&'static str),
}

impl EngineError {
    pub(crate) fn duplicate_publisher(key: &TypeKey) -> Self {
        EngineError::DuplicatePublisher(key.name())
    }

    pub(crate) fn already_present(key: &TypeKey) -> Self {
        EngineError::AlreadyPresent(key.name())
    }

    pub(crate) fn already_checked_out(key: &TypeKey) -> Self {
        EngineError::AlreadyCheckedOut(key.name())
    }

    pub(crate) fn decoration_missing(key: &TypeKey) -> Self {
        EngineError::DecorationMissing(key.name())
    }

    pub(crate) fn null_handle(key: &TypeKey) -> Self {
        EngineError::NullHandle(key.name())
    }
}
