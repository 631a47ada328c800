//! Class shape metadata
//!
//! A class is an ordinary pointers object whose fixed slots hold the
//! superclass, the method dictionary, a format descriptor and a name. The
//! format descriptor packs the fixed-slot count and the kind of variable
//! tail instances carry, and [`InstanceSpec`] is its decoded form.

use crate::error::{HeapError, HeapResult};
use crate::value::Value;

/// Fixed-slot indices of class objects.
pub mod class_slot {
    /// Superclass, or nil at the root of a hierarchy.
    pub const SUPERCLASS: usize = 0;
    /// Method dictionary object.
    pub const METHOD_DICT: usize = 1;
    /// Packed instance format (see [`super::InstanceSpec`]).
    pub const FORMAT: usize = 2;
    /// Name symbol, or nil for anonymous classes.
    pub const NAME: usize = 3;
    /// Number of fixed slots in a class object.
    pub const CLASS_SIZE: usize = 4;
}

/// The kind of indexable tail instances of a class carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailKind {
    /// Fixed-size instances only
    None,
    /// Variable pointer slots
    Pointers,
    /// Variable byte slots
    Bytes,
    /// Variable 32-bit word slots
    Words,
    /// Variable pointer slots with weak referents
    Weak,
    /// Boxed 64-bit float, indexable as two 32-bit words
    Float,
    /// Header + literal frame + byte body
    CompiledMethod,
}

impl TailKind {
    fn code(self) -> i64 {
        match self {
            TailKind::None => 0,
            TailKind::Pointers => 1,
            TailKind::Bytes => 2,
            TailKind::Words => 3,
            TailKind::Weak => 4,
            TailKind::Float => 5,
            TailKind::CompiledMethod => 6,
        }
    }

    fn from_code(code: i64) -> HeapResult<TailKind> {
        Ok(match code {
            0 => TailKind::None,
            1 => TailKind::Pointers,
            2 => TailKind::Bytes,
            3 => TailKind::Words,
            4 => TailKind::Weak,
            5 => TailKind::Float,
            6 => TailKind::CompiledMethod,
            _ => return Err(HeapError::WrongFormat),
        })
    }
}

/// Decoded instance shape of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Number of named fixed slots
    pub fixed_fields: u16,
    /// Kind of the variable tail
    pub tail: TailKind,
}

impl InstanceSpec {
    /// A fixed-size pointers shape.
    pub fn fixed(fixed_fields: u16) -> InstanceSpec {
        InstanceSpec {
            fixed_fields,
            tail: TailKind::None,
        }
    }

    /// A shape with a variable tail.
    pub fn variable(fixed_fields: u16, tail: TailKind) -> InstanceSpec {
        InstanceSpec { fixed_fields, tail }
    }

    /// Whether instances have an indexable part.
    pub fn is_variable(self) -> bool {
        !matches!(self.tail, TailKind::None)
    }

    /// Pack into the format slot value.
    pub fn encode(self) -> Value {
        Value::SmallInt(i64::from(self.fixed_fields) * 16 + self.tail.code())
    }

    /// Unpack from the format slot value.
    pub fn decode(format: Value) -> HeapResult<InstanceSpec> {
        let raw = format.as_small_int().ok_or(HeapError::WrongFormat)?;
        if raw < 0 {
            return Err(HeapError::WrongFormat);
        }
        Ok(InstanceSpec {
            fixed_fields: u16::try_from(raw / 16).map_err(|_| HeapError::WrongFormat)?,
            tail: TailKind::from_code(raw % 16)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trip() {
        for spec in [
            InstanceSpec::fixed(0),
            InstanceSpec::fixed(9),
            InstanceSpec::variable(0, TailKind::Bytes),
            InstanceSpec::variable(6, TailKind::Pointers),
            InstanceSpec::variable(0, TailKind::Weak),
            InstanceSpec::variable(0, TailKind::Words),
        ] {
            assert_eq!(InstanceSpec::decode(spec.encode()).unwrap(), spec);
        }
    }

    #[test]
    fn variable_query() {
        assert!(!InstanceSpec::fixed(3).is_variable());
        assert!(InstanceSpec::variable(0, TailKind::Bytes).is_variable());
    }
}
