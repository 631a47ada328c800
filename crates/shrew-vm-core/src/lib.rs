//! # Shrew VM Core
//!
//! Core execution engine for the Shrew Smalltalk virtual machine: the
//! activation model (method and block contexts, closures, non-local
//! returns), the fetch/decode/execute loop, method lookup with its global
//! cache, the numbered primitive table, and the cooperative process
//! scheduler.
//!
//! ## Design Principles
//!
//! - **Contexts are heap objects**: every activation is a first-class
//!   pointers object; the interpreter only virtualizes the pc of the
//!   context it is currently running
//! - **Control flow as values**: returns, process switches and stack
//!   overflows travel as a sum type through the dispatch results, never as
//!   host-language unwinding
//! - **One `Vm` record**: all global mutable state (method cache,
//!   interrupt counter, host services, well-known objects) lives in one
//!   struct with an explicit lifecycle

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod host;
pub mod interpreter;
pub mod kernel;
pub mod method_cache;
pub mod primitives;
pub mod scheduler;
pub mod vm;

pub use context::Context;
pub use error::{PrimitiveFailure, VmError, VmEvent};
pub use host::{HostError, HostServices, NullHost};
pub use method_cache::{MethodCache, MethodNotFound};
pub use primitives::{PrimOutcome, PrimitiveTable};
pub use vm::{Vm, VmConfig};
