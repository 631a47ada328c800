//! Heap errors

use thiserror::Error;

/// Errors raised by object-memory operations.
///
/// Callers on the primitive path translate any of these into a primitive
/// failure; the interpreter proper treats them as signs of a malformed
/// object graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// Index outside the object's fixed or indexable bounds
    #[error("index out of bounds")]
    OutOfBounds,

    /// Operation applied to an object of the wrong format, e.g. a byte
    /// read on a pointers object
    #[error("wrong object format")]
    WrongFormat,

    /// An immediate value where a heap object was required
    #[error("immediate value has no object record")]
    Immediate,

    /// Integer does not fit the tagged small-integer range
    #[error("integer outside the tagged range")]
    IntegerOutOfRange,

    /// Value was not of the type the caller unwrapped it as
    #[error("value of unexpected type")]
    UnexpectedType,
}

/// Result type for heap operations
pub type HeapResult<T> = Result<T, HeapError>;
