//! Bytecode opcodes
//!
//! The opcode space 0..=255 is partitioned into named ranges. Most opcodes
//! encode an operand (a variable index, a jump offset, a selector index) in
//! the low bits of the opcode byte; a few take up to three parameter bytes.
//!
//! [`Opcode::decode`] maps a byte to a structured instruction, and
//! [`opcode_info`] answers the parameter-byte count and jump flag the
//! interpreter needs to advance its program counter.

use serde::{Deserialize, Serialize};

/// A constant pushable by the one-byte push-constant opcodes 113..=119.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushedConstant {
    /// `true`
    True,
    /// `false`
    False,
    /// `nil`
    Nil,
    /// `-1`
    MinusOne,
    /// `0`
    Zero,
    /// `1`
    One,
    /// `2`
    Two,
}

/// Arithmetic and comparison shortcut sends (opcodes 176..=191).
///
/// Each of these tries the matching numbered primitive directly and falls
/// back to a full send of the selector when the primitive fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticSend {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `<`
    LessThan,
    /// `>`
    GreaterThan,
    /// `<=`
    LessOrEqual,
    /// `>=`
    GreaterOrEqual,
    /// `=`
    Equal,
    /// `~=`
    NotEqual,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `\\`
    Mod,
    /// `@`
    MakePoint,
    /// `bitShift:`
    BitShift,
    /// `//`
    Div,
    /// `bitAnd:`
    BitAnd,
    /// `bitOr:`
    BitOr,
}

impl ArithmeticSend {
    const ALL: [ArithmeticSend; 16] = [
        ArithmeticSend::Add,
        ArithmeticSend::Subtract,
        ArithmeticSend::LessThan,
        ArithmeticSend::GreaterThan,
        ArithmeticSend::LessOrEqual,
        ArithmeticSend::GreaterOrEqual,
        ArithmeticSend::Equal,
        ArithmeticSend::NotEqual,
        ArithmeticSend::Multiply,
        ArithmeticSend::Divide,
        ArithmeticSend::Mod,
        ArithmeticSend::MakePoint,
        ArithmeticSend::BitShift,
        ArithmeticSend::Div,
        ArithmeticSend::BitAnd,
        ArithmeticSend::BitOr,
    ];

    /// The fallback selector for this shortcut.
    pub fn selector(self) -> &'static str {
        match self {
            ArithmeticSend::Add => "+",
            ArithmeticSend::Subtract => "-",
            ArithmeticSend::LessThan => "<",
            ArithmeticSend::GreaterThan => ">",
            ArithmeticSend::LessOrEqual => "<=",
            ArithmeticSend::GreaterOrEqual => ">=",
            ArithmeticSend::Equal => "=",
            ArithmeticSend::NotEqual => "~=",
            ArithmeticSend::Multiply => "*",
            ArithmeticSend::Divide => "/",
            ArithmeticSend::Mod => "\\\\",
            ArithmeticSend::MakePoint => "@",
            ArithmeticSend::BitShift => "bitShift:",
            ArithmeticSend::Div => "//",
            ArithmeticSend::BitAnd => "bitAnd:",
            ArithmeticSend::BitOr => "bitOr:",
        }
    }
}

/// Specialized sends (opcodes 192..=207).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialSend {
    /// `at:` — full send
    At,
    /// `at:put:` — full send
    AtPut,
    /// `size` — full send
    Size,
    /// `next` — full send
    Next,
    /// `nextPut:` — full send
    NextPut,
    /// `atEnd` — full send
    AtEnd,
    /// `==` — quick primitive, no fallback
    Equivalent,
    /// `class` — quick primitive, no fallback
    Class,
    /// `blockCopy:` — direct primitive, reads the caller's pc
    BlockCopy,
    /// `value` — direct primitive, dispatched on the receiver's class
    Value,
    /// `value:` — direct primitive, dispatched on the receiver's class
    ValueWithArg,
    /// `do:` — full send
    Do,
    /// `new` — full send
    New,
    /// `new:` — full send
    NewWithArg,
    /// `x` — full send
    PointX,
    /// `y` — full send
    PointY,
}

impl SpecialSend {
    const ALL: [SpecialSend; 16] = [
        SpecialSend::At,
        SpecialSend::AtPut,
        SpecialSend::Size,
        SpecialSend::Next,
        SpecialSend::NextPut,
        SpecialSend::AtEnd,
        SpecialSend::Equivalent,
        SpecialSend::Class,
        SpecialSend::BlockCopy,
        SpecialSend::Value,
        SpecialSend::ValueWithArg,
        SpecialSend::Do,
        SpecialSend::New,
        SpecialSend::NewWithArg,
        SpecialSend::PointX,
        SpecialSend::PointY,
    ];

    /// The selector this opcode stands for.
    pub fn selector(self) -> &'static str {
        match self {
            SpecialSend::At => "at:",
            SpecialSend::AtPut => "at:put:",
            SpecialSend::Size => "size",
            SpecialSend::Next => "next",
            SpecialSend::NextPut => "nextPut:",
            SpecialSend::AtEnd => "atEnd",
            SpecialSend::Equivalent => "==",
            SpecialSend::Class => "class",
            SpecialSend::BlockCopy => "blockCopy:",
            SpecialSend::Value => "value",
            SpecialSend::ValueWithArg => "value:",
            SpecialSend::Do => "do:",
            SpecialSend::New => "new",
            SpecialSend::NewWithArg => "new:",
            SpecialSend::PointX => "x",
            SpecialSend::PointY => "y",
        }
    }

    /// Number of arguments the selector takes.
    pub fn argument_count(self) -> usize {
        match self {
            SpecialSend::AtPut => 2,
            SpecialSend::At
            | SpecialSend::NextPut
            | SpecialSend::Equivalent
            | SpecialSend::BlockCopy
            | SpecialSend::ValueWithArg
            | SpecialSend::Do
            | SpecialSend::NewWithArg => 1,
            _ => 0,
        }
    }
}

/// A decoded one-byte opcode.
///
/// Parameter bytes are not part of this value; the interpreter fetches them
/// itself, guided by [`opcode_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// 0..=15: push receiver variable
    PushReceiverVariable(u8),
    /// 16..=31: push temporary
    PushTemporaryVariable(u8),
    /// 32..=63: push literal constant
    PushLiteralConstant(u8),
    /// 64..=95: push the value of a literal Association
    PushLiteralVariable(u8),
    /// 96..=103: store stack top into receiver variable, then pop
    StorePopReceiverVariable(u8),
    /// 104..=111: store stack top into temporary, then pop
    StorePopTemporaryVariable(u8),
    /// 112: push the receiver
    PushReceiver,
    /// 113..=119: push a well-known constant
    PushConstant(PushedConstant),
    /// 120: return the receiver to the home sender
    ReturnReceiver,
    /// 121: return `true` to the home sender
    ReturnTrue,
    /// 122: return `false` to the home sender
    ReturnFalse,
    /// 123: return `nil` to the home sender
    ReturnNil,
    /// 124: return stack top to the home sender
    ReturnTopFromMethod,
    /// 125: return stack top to this context's sender
    ReturnTopFromBlock,
    /// 128 [1]: extended push (type and index in the descriptor byte)
    ExtendedPush,
    /// 129 [1]: extended store
    ExtendedStore,
    /// 130 [1]: extended store and pop
    ExtendedStorePop,
    /// 131 [1]: send with selector index and argument count in one byte
    SingleExtendedSend,
    /// 132 [2]: the do-anything escape (sends, pushes and stores)
    DoubleExtendedDoAnything,
    /// 133 [1]: super send with selector index and argument count in one byte
    SingleExtendedSuper,
    /// 134 [1]: send with a 6-bit selector index and 2-bit argument count
    SecondExtendedSend,
    /// 135: pop stack top
    Pop,
    /// 136: duplicate stack top
    Dup,
    /// 137: push the active context (`thisContext`)
    PushActiveContext,
    /// 138 [1]: push a fresh Array, optionally filled from the stack
    PushNewArray,
    /// 140 [2]: push an indirect temporary
    PushRemoteTemp,
    /// 141 [2]: store into an indirect temporary
    StoreRemoteTemp,
    /// 142 [2]: store into an indirect temporary, then pop
    StorePopRemoteTemp,
    /// 143 [3, jump]: push a closure and skip its inline body
    PushClosure,
    /// 144..=151 [jump]: forward jump of 1..=8
    ShortUnconditionalJump(u8),
    /// 152..=159 [jump]: forward jump of 1..=8 when stack top is `false`
    ShortJumpIfFalse(u8),
    /// 160..=167 [1, jump]: signed long jump, high bits in the opcode
    LongUnconditionalJump(u8),
    /// 168..=171 [1, jump]: long forward jump when stack top is `true`
    LongJumpIfTrue(u8),
    /// 172..=175 [1, jump]: long forward jump when stack top is `false`
    LongJumpIfFalse(u8),
    /// 176..=191: arithmetic shortcut send
    SendArithmetic(ArithmeticSend),
    /// 192..=207: specialized send
    SendSpecial(SpecialSend),
    /// 208..=255: send a literal selector (index in low 4 bits, argument
    /// count in bits 4..=5)
    SendLiteralSelector {
        /// Literal index of the selector
        selector: u8,
        /// Number of arguments
        arguments: u8,
    },
    /// 126, 127, 139: reserved, decodes to an error at execution time
    Reserved(u8),
}

impl Opcode {
    /// Decode one opcode byte.
    pub fn decode(byte: u8) -> Opcode {
        match byte {
            0..=15 => Opcode::PushReceiverVariable(byte & 15),
            16..=31 => Opcode::PushTemporaryVariable(byte & 15),
            32..=63 => Opcode::PushLiteralConstant(byte & 31),
            64..=95 => Opcode::PushLiteralVariable(byte & 31),
            96..=103 => Opcode::StorePopReceiverVariable(byte & 7),
            104..=111 => Opcode::StorePopTemporaryVariable(byte & 7),
            112 => Opcode::PushReceiver,
            113 => Opcode::PushConstant(PushedConstant::True),
            114 => Opcode::PushConstant(PushedConstant::False),
            115 => Opcode::PushConstant(PushedConstant::Nil),
            116 => Opcode::PushConstant(PushedConstant::MinusOne),
            117 => Opcode::PushConstant(PushedConstant::Zero),
            118 => Opcode::PushConstant(PushedConstant::One),
            119 => Opcode::PushConstant(PushedConstant::Two),
            120 => Opcode::ReturnReceiver,
            121 => Opcode::ReturnTrue,
            122 => Opcode::ReturnFalse,
            123 => Opcode::ReturnNil,
            124 => Opcode::ReturnTopFromMethod,
            125 => Opcode::ReturnTopFromBlock,
            126 | 127 | 139 => Opcode::Reserved(byte),
            128 => Opcode::ExtendedPush,
            129 => Opcode::ExtendedStore,
            130 => Opcode::ExtendedStorePop,
            131 => Opcode::SingleExtendedSend,
            132 => Opcode::DoubleExtendedDoAnything,
            133 => Opcode::SingleExtendedSuper,
            134 => Opcode::SecondExtendedSend,
            135 => Opcode::Pop,
            136 => Opcode::Dup,
            137 => Opcode::PushActiveContext,
            138 => Opcode::PushNewArray,
            140 => Opcode::PushRemoteTemp,
            141 => Opcode::StoreRemoteTemp,
            142 => Opcode::StorePopRemoteTemp,
            143 => Opcode::PushClosure,
            144..=151 => Opcode::ShortUnconditionalJump(byte & 7),
            152..=159 => Opcode::ShortJumpIfFalse(byte & 7),
            160..=167 => Opcode::LongUnconditionalJump(byte & 7),
            168..=171 => Opcode::LongJumpIfTrue(byte & 3),
            172..=175 => Opcode::LongJumpIfFalse(byte & 3),
            176..=191 => Opcode::SendArithmetic(ArithmeticSend::ALL[(byte & 15) as usize]),
            192..=207 => Opcode::SendSpecial(SpecialSend::ALL[(byte & 15) as usize]),
            208..=255 => Opcode::SendLiteralSelector {
                selector: byte & 15,
                arguments: ((byte >> 4) & 3) - 1,
            },
        }
    }
}

/// Static decode metadata for one opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// Family name, for traces and disassembly
    pub name: &'static str,
    /// Number of parameter bytes following the opcode byte
    pub parameter_bytes: u8,
    /// Whether the opcode changes the pc in a data-dependent way
    pub is_jump: bool,
}

const fn info_entry(byte: u8) -> OpcodeInfo {
    macro_rules! entry {
        ($name:expr, $params:expr, $jump:expr) => {
            OpcodeInfo {
                name: $name,
                parameter_bytes: $params,
                is_jump: $jump,
            }
        };
    }
    match byte {
        0..=15 => entry!("pushReceiverVariable", 0, false),
        16..=31 => entry!("pushTemporaryVariable", 0, false),
        32..=63 => entry!("pushLiteralConstant", 0, false),
        64..=95 => entry!("pushLiteralVariable", 0, false),
        96..=103 => entry!("storeAndPopReceiverVariable", 0, false),
        104..=111 => entry!("storeAndPopTemporaryVariable", 0, false),
        112 => entry!("pushReceiver", 0, false),
        113..=119 => entry!("pushConstant", 0, false),
        120..=123 => entry!("returnConstant", 0, false),
        124 => entry!("returnTopFromMethod", 0, false),
        125 => entry!("returnTopFromBlock", 0, false),
        126 | 127 | 139 => entry!("reserved", 0, false),
        128 => entry!("extendedPush", 1, false),
        129 => entry!("extendedStore", 1, false),
        130 => entry!("extendedStoreAndPop", 1, false),
        131 => entry!("singleExtendedSend", 1, false),
        132 => entry!("doubleExtendedDoAnything", 2, false),
        133 => entry!("singleExtendedSuper", 1, false),
        134 => entry!("secondExtendedSend", 1, false),
        135 => entry!("pop", 0, false),
        136 => entry!("dup", 0, false),
        137 => entry!("pushActiveContext", 0, false),
        138 => entry!("pushNewArray", 1, false),
        140 => entry!("pushRemoteTemp", 2, false),
        141 => entry!("storeRemoteTemp", 2, false),
        142 => entry!("storeAndPopRemoteTemp", 2, false),
        143 => entry!("pushClosure", 3, true),
        144..=151 => entry!("shortUnconditionalJump", 0, true),
        152..=159 => entry!("shortJumpIfFalse", 0, true),
        160..=167 => entry!("longUnconditionalJump", 1, true),
        168..=171 => entry!("longJumpIfTrue", 1, true),
        172..=175 => entry!("longJumpIfFalse", 1, true),
        176..=191 => entry!("sendArithmetic", 0, false),
        192..=207 => entry!("sendSpecial", 0, false),
        208..=255 => entry!("sendLiteralSelector", 0, false),
    }
}

const OPCODE_TABLE: [OpcodeInfo; 256] = {
    let mut table = [OpcodeInfo {
        name: "",
        parameter_bytes: 0,
        is_jump: false,
    }; 256];
    let mut byte = 0usize;
    while byte < 256 {
        table[byte] = info_entry(byte as u8);
        byte += 1;
    }
    table
};

/// Decode metadata for an opcode byte.
#[inline]
pub fn opcode_info(byte: u8) -> &'static OpcodeInfo {
    &OPCODE_TABLE[byte as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_byte_decodes() {
        for byte in 0u16..=255 {
            let opcode = Opcode::decode(byte as u8);
            let reserved = matches!(byte, 126 | 127 | 139);
            assert_eq!(matches!(opcode, Opcode::Reserved(_)), reserved, "{byte}");
        }
    }

    #[test]
    fn literal_send_encoding() {
        // 208: selector 0, no arguments; 240: selector 0, two arguments.
        assert_eq!(
            Opcode::decode(208),
            Opcode::SendLiteralSelector {
                selector: 0,
                arguments: 0
            }
        );
        assert_eq!(
            Opcode::decode(240),
            Opcode::SendLiteralSelector {
                selector: 0,
                arguments: 2
            }
        );
        assert_eq!(
            Opcode::decode(255),
            Opcode::SendLiteralSelector {
                selector: 15,
                arguments: 2
            }
        );
    }

    #[test]
    fn parameter_byte_counts() {
        assert_eq!(opcode_info(0).parameter_bytes, 0);
        assert_eq!(opcode_info(128).parameter_bytes, 1);
        assert_eq!(opcode_info(132).parameter_bytes, 2);
        assert_eq!(opcode_info(143).parameter_bytes, 3);
        assert!(opcode_info(143).is_jump);
        assert!(opcode_info(144).is_jump);
        assert!(!opcode_info(176).is_jump);
    }

    #[test]
    fn arithmetic_selectors() {
        assert_eq!(
            Opcode::decode(176),
            Opcode::SendArithmetic(ArithmeticSend::Add)
        );
        assert_eq!(
            Opcode::decode(191),
            Opcode::SendArithmetic(ArithmeticSend::BitOr)
        );
        assert_eq!(ArithmeticSend::Mod.selector(), "\\\\");
    }

    #[test]
    fn special_send_argument_counts() {
        assert_eq!(Opcode::decode(192), Opcode::SendSpecial(SpecialSend::At));
        assert_eq!(SpecialSend::AtPut.argument_count(), 2);
        assert_eq!(SpecialSend::Class.argument_count(), 0);
        assert_eq!(
            Opcode::decode(207),
            Opcode::SendSpecial(SpecialSend::PointY)
        );
    }
}
