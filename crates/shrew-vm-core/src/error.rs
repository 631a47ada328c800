//! VM errors and control-flow events

use shrew_vm_heap::{HeapError, ObjRef, Value};
use thiserror::Error;

/// Fatal conditions that end interpretation.
#[derive(Debug, Error)]
pub enum VmError {
    /// Store into a literal constant
    #[error("illegal store into a literal constant")]
    IllegalStore,

    /// A reserved opcode was executed
    #[error("reserved bytecode {byte} at pc {pc}")]
    ReservedBytecode {
        /// The opcode byte
        byte: u8,
        /// Where it was fetched
        pc: usize,
    },

    /// `doesNotUnderstand:` itself was not understood
    #[error("Missing doesNotUnderstand in hierarchy of {class_name}")]
    MissingDoesNotUnderstand {
        /// Receiver's class name
        class_name: String,
    },

    /// A special selector the VM must send is absent from the image
    #[error("missing #{selector} in hierarchy of {class_name}")]
    MissingSpecialMethod {
        /// The selector the VM tried to send
        selector: String,
        /// Receiver's class name
        class_name: String,
    },

    /// A return unwound past the end of the sender chain without finding
    /// its target
    #[error("return target not found on the sender chain")]
    BrokenSenderChain,

    /// The scheduler has no runnable process left
    #[error("deadlock: no runnable process")]
    Deadlock,

    /// The object graph contradicts an interpreter invariant
    #[error("malformed object graph: {0}")]
    CorruptObject(#[from] HeapError),

    /// Explicit VM termination (`quit` and unrecoverable errors)
    #[error("exit: {reason}")]
    Exit {
        /// Human-readable reason
        reason: String,
    },
}

/// Control-flow events carried up through the dispatch results.
///
/// These are not errors: the interpreter loop inspects the variant at each
/// boundary and takes the matching action.
#[derive(Debug)]
pub enum VmEvent {
    /// A return unwinding toward `target`, which receives `value` on its
    /// stack
    Return {
        /// Context the return is headed for
        target: ObjRef,
        /// The returned value
        value: Value,
    },
    /// A return whose target chain ended at nil: interpretation is done
    TopLevelReturn {
        /// The returned value
        value: Value,
    },
    /// Cooperative switch to another process's context
    ProcessSwitch {
        /// The context to make active
        context: ObjRef,
    },
    /// Activation depth exhausted; re-enter `context` from the top loop
    StackOverflow {
        /// The frame that was about to run
        context: ObjRef,
    },
    /// Fatal condition
    Abort(VmError),
}

/// Why a primitive did not complete.
///
/// Both variants are recovered identically by the send path: the stack is
/// left as it was and the Smalltalk fallback body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveFailure {
    /// The primitive ran and declined
    Failed,
    /// The slot is populated but not implemented
    NotYetImplemented,
}

/// Result type for one bytecode step: `Ok` continues the current context.
pub type StepResult = Result<(), VmEvent>;
