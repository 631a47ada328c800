//! Heap object records
//!
//! Every heap object carries a class reference, a lazily assigned identity
//! hash, and a body whose variant is the object's format. Operations
//! dispatch on the body tag; byte and word bodies carry no pointer slots.

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

use crate::method::CompiledMethod;
use crate::value::{ObjRef, Value};

/// A method dictionary: selector symbol to compiled method.
///
/// Insertion order is preserved so enumeration is deterministic.
pub type MethodDict = IndexMap<ObjRef, ObjRef, FxBuildHasher>;

/// Object content, tagged by format.
#[derive(Debug, Clone)]
pub enum Body {
    /// Fixed slots followed by an optional variable pointer tail
    Pointers(Vec<Value>),
    /// Pointer slots whose referents may be cleared by the collector
    WeakPointers(Vec<Value>),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Raw 32-bit words
    Words(Vec<u32>),
    /// Boxed float, indexable as two 32-bit halves
    Float(f64),
    /// Executable method: header, literal frame, byte body
    Method(CompiledMethod),
    /// Selector-to-method mapping of a class
    MethodDict(MethodDict),
}

/// One heap object record.
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// The object's class
    pub class: ObjRef,
    /// Identity hash; 0 until first asked for
    pub(crate) hash: u32,
    /// Mark bit for the collector
    pub(crate) marked: bool,
    /// Format-tagged content
    pub body: Body,
}

impl HeapObject {
    /// Create a record with an unassigned hash.
    pub fn new(class: ObjRef, body: Body) -> HeapObject {
        HeapObject {
            class,
            hash: 0,
            marked: false,
            body,
        }
    }

    /// Number of pointer slots, bytes or words in the body.
    pub fn raw_len(&self) -> usize {
        match &self.body {
            Body::Pointers(slots) | Body::WeakPointers(slots) => slots.len(),
            Body::Bytes(bytes) => bytes.len(),
            Body::Words(words) => words.len(),
            Body::Float(_) => 2,
            Body::Method(method) => method.byte_size(),
            Body::MethodDict(dict) => dict.len(),
        }
    }

    /// Pointer slots, if this is a pointers or weak-pointers object.
    pub fn slots(&self) -> Option<&[Value]> {
        match &self.body {
            Body::Pointers(slots) | Body::WeakPointers(slots) => Some(slots),
            _ => None,
        }
    }

    /// Mutable pointer slots, if this is a pointers or weak-pointers object.
    pub fn slots_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.body {
            Body::Pointers(slots) | Body::WeakPointers(slots) => Some(slots),
            _ => None,
        }
    }
}
