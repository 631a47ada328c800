//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while decoding bytecode or method headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BytecodeError {
    /// Opcode is reserved and must not appear in well-formed methods
    #[error("reserved opcode {0} at pc {1}")]
    ReservedOpcode(u8, usize),

    /// Method body ended in the middle of an instruction
    #[error("truncated instruction at pc {0}")]
    TruncatedInstruction(usize),

    /// Header word has the sign bit set
    #[error("negative method header word")]
    NegativeHeader,
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
