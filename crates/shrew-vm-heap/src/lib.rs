//! # Shrew VM Heap
//!
//! Object memory for the Shrew Smalltalk virtual machine: tagged values,
//! the heap arena of class-tagged objects, instance shape metadata,
//! two-way identity swaps (`become:`), a mark/sweep collector, and the
//! object space that ties well-known objects and interned symbols together.
//!
//! ## Design Principles
//!
//! - **Handle-based**: every reference is an arena index, so context graphs
//!   may be cyclic and identity swaps are O(1) record swaps
//! - **Tagged small integers**: immediate 63-bit integers never allocate
//! - **Polymorphic bodies**: one object record, one body variant per format

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod class;
pub mod error;
pub mod heap;
pub mod method;
pub mod object;
pub mod space;
pub mod value;

pub use class::{InstanceSpec, TailKind, class_slot};
pub use error::{HeapError, HeapResult};
pub use heap::{GcStats, Heap};
pub use method::{CompiledMethod, CompiledMethodBuilder};
pub use object::{Body, HeapObject, MethodDict};
pub use space::{KnownClasses, ObjectSpace, SpecialObjects};
pub use value::{ObjRef, SMALL_INT_MAX, SMALL_INT_MIN, Value};
