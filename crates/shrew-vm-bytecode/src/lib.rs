//! # Shrew VM Bytecode
//!
//! This crate defines the instruction set of the Shrew Smalltalk virtual
//! machine: the classic 256-entry one-byte opcode space and the compiled
//! method header word that describes a method's literal frame, temporaries
//! and primitive binding.
//!
//! ## Design Principles
//!
//! - **Stack-based**: Operations push and pop the active context's stack
//! - **Dense**: Most opcodes encode their operand in the opcode byte itself;
//!   at most three parameter bytes follow
//! - **Table-driven**: A static 256-entry table carries the parameter-byte
//!   count and jump flag for every opcode, so decoding never needs lookahead

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod header;
pub mod opcode;

pub use error::BytecodeError;
pub use header::MethodHeader;
pub use opcode::{ArithmeticSend, Opcode, OpcodeInfo, PushedConstant, SpecialSend, opcode_info};

/// Number of distinct one-byte opcodes.
pub const OPCODE_COUNT: usize = 256;
