//! Error types for the reactive engine.
//!
//! Two failure families exist and are handled differently:
//!
//! - Structural/protection violations (writing a readonly computed, touching
//!   a protected key, cyclic computation) fail fast with an [`ObxError`] at
//!   the call site and are never swallowed.
//! - User computation failures (panics inside a tracked closure) are
//!   contained on the derivation as a caught-exception sentinel and re-raised
//!   only when the failing value is read. See `derivation::CaughtException`.

use thiserror::Error;

/// Errors raised synchronously by engine operations.
#[derive(Debug, Error)]
pub enum ObxError {
    /// Assignment to a computed value that has a getter but no setter.
    #[error("cannot assign a new value to readonly value '{0}'")]
    ReadonlyAssignment(String),

    /// A setter attempted to update the property it belongs to.
    #[error("the setter of observable value '{0}' is trying to update itself")]
    SetterCycle(String),

    /// A computed value read itself, directly or transitively, while
    /// recomputing.
    #[error("cycle detected in computation '{0}'")]
    ComputationCycle(String),

    /// Nested computed evaluation exceeded the runaway-recursion guard.
    #[error("computation depth limit exceeded while evaluating '{0}'")]
    ComputationDepthExceeded(String),

    /// Attempt to overwrite or delete an engine-internal key.
    #[error("cannot mutate protected key '{0}'")]
    ProtectedKey(String),

    /// Attempt to add or remove keys on a sealed object.
    #[error("cannot add or remove property '{0}' on a sealed object")]
    SealedObject(String),
}

pub type Result<T> = std::result::Result<T, ObxError>;
