//! Bytecode opcodes
//!
//! This module defines the closed instruction set the mechanism rewrites.
//! Opcodes are grouped by category and assigned contiguous ranges. Dispatch
//! is always over this tagged set via an explicit lookup table; there is no
//! name-based dispatch anywhere.
//!
//! Several operations come in a narrow/wide pair (one-byte vs two-byte
//! operand). The editable instruction stream only ever sees the canonical
//! (narrow) member of a pair; the width actually emitted is chosen at link
//! time by the active [`InstructionEncoding`](super::encoding::InstructionEncoding)
//! based on operand magnitude.

use std::fmt;

/// Bytecode opcode enumeration
///
/// Each opcode is assigned a unique u8 value with reserved gaps between
/// groups for future expansion.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // === Stack Operations (0x00-0x0F) ===
    /// No operation
    Nop = 0x00,
    /// Discard top of stack
    Pop = 0x01,
    /// Duplicate top of stack
    Dup = 0x02,
    /// Swap top two stack elements
    Swap = 0x03,
    /// Copy second element: [a,b] -> [a,b,a]
    Over = 0x04,

    // === Value Creation (0x10-0x1F) ===
    /// Push Nil
    PushNil = 0x10,
    /// Push Bool(true)
    PushTrue = 0x11,
    /// Push Bool(false)
    PushFalse = 0x12,
    /// Push small integer (-128 to 127), value is next byte
    PushSmall = 0x13,
    /// Push constant from pool, index is next byte
    PushConst = 0x14,
    /// Push constant from pool, index is next 2 bytes
    PushConstWide = 0x15,

    // === Local Variables (0x20-0x2F) ===
    /// Load value from local slot, index is next byte
    LoadLocal = 0x20,
    /// Load value from local slot, index is next 2 bytes
    LoadLocalWide = 0x21,
    /// Store value to local slot, index is next byte
    StoreLocal = 0x22,
    /// Store value to local slot, index is next 2 bytes
    StoreLocalWide = 0x23,

    // === Globals (0x30-0x3F) ===
    /// Load global; operand is constant-pool index of the name
    LoadGlobal = 0x30,
    /// Load global, 2-byte name index
    LoadGlobalWide = 0x31,
    /// Store global; operand is constant-pool index of the name
    StoreGlobal = 0x32,
    /// Store global, 2-byte name index
    StoreGlobalWide = 0x33,

    // === Control Flow (0x40-0x4F) ===
    /// Unconditional jump, offset is next 2 bytes (signed, relative)
    Jump = 0x40,
    /// Pop condition, jump if falsy
    JumpIfFalse = 0x41,
    /// Pop condition, jump if truthy
    JumpIfTrue = 0x42,
    /// Call a function: 2-byte callee constant index + 1-byte arity
    Call = 0x48,
    /// Return from function with top of stack
    Return = 0x4C,

    // === Arithmetic (0x50-0x5F) ===
    /// Addition: [a, b] -> [a + b]
    Add = 0x50,
    /// Subtraction: [a, b] -> [a - b]
    Sub = 0x51,
    /// Multiplication: [a, b] -> [a * b]
    Mul = 0x52,
    /// Division: [a, b] -> [a / b]
    Div = 0x53,
    /// Modulo: [a, b] -> [a % b]
    Mod = 0x54,
    /// Negation: [a] -> [-a]
    Neg = 0x55,
    /// Absolute value: [a] -> [|a|]
    Abs = 0x56,

    // === Comparison (0x60-0x6F) ===
    /// Less than: [a, b] -> [a < b]
    Lt = 0x60,
    /// Less than or equal
    Le = 0x61,
    /// Greater than
    Gt = 0x62,
    /// Greater than or equal
    Ge = 0x63,
    /// Equal (any value kinds)
    Eq = 0x64,
    /// Not equal
    Ne = 0x65,

    // === Boolean (0x70-0x7F) ===
    /// Logical and: [a, b] -> [a && b]
    And = 0x70,
    /// Logical or: [a, b] -> [a || b]
    Or = 0x71,
    /// Logical not: [a] -> [!a]
    Not = 0x72,
    /// Exclusive or: [a, b] -> [a ^ b]
    Xor = 0x73,

    // === Meta (0xFF) ===
    /// Stop execution immediately, yielding nil
    Halt = 0xFF,
}

/// Classification of an opcode's operand, used by the linker to validate
/// and emit arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// No operand bytes
    None,
    /// Raw immediate byte (PushSmall)
    Immediate,
    /// Constant-pool index
    Const,
    /// Local slot index
    Local,
    /// Relative jump offset (always 2 bytes, resolved at link time)
    Jump,
    /// Call spec: callee constant index + arity
    Call,
}

impl Opcode {
    /// Convert byte to opcode, returns None if invalid
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_TABLE.get(byte as usize).copied().flatten()
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Number of operand bytes following this opcode in the encoded stream
    #[inline]
    pub fn immediate_size(self) -> usize {
        match self {
            Self::Nop | Self::Pop | Self::Dup | Self::Swap | Self::Over
            | Self::PushNil | Self::PushTrue | Self::PushFalse
            | Self::Return | Self::Halt
            | Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod
            | Self::Neg | Self::Abs
            | Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne
            | Self::And | Self::Or | Self::Not | Self::Xor => 0,

            Self::PushSmall | Self::PushConst | Self::LoadLocal | Self::StoreLocal
            | Self::LoadGlobal | Self::StoreGlobal => 1,

            Self::PushConstWide | Self::LoadLocalWide | Self::StoreLocalWide
            | Self::LoadGlobalWide | Self::StoreGlobalWide
            | Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue => 2,

            // 2-byte callee index + 1-byte arity
            Self::Call => 3,
        }
    }

    /// What the operand of this opcode refers to
    pub fn arg_kind(self) -> ArgKind {
        match self {
            Self::PushSmall => ArgKind::Immediate,
            Self::PushConst | Self::PushConstWide
            | Self::LoadGlobal | Self::LoadGlobalWide
            | Self::StoreGlobal | Self::StoreGlobalWide => ArgKind::Const,
            Self::LoadLocal | Self::LoadLocalWide
            | Self::StoreLocal | Self::StoreLocalWide => ArgKind::Local,
            Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue => ArgKind::Jump,
            Self::Call => ArgKind::Call,
            _ => ArgKind::None,
        }
    }

    /// Canonical (narrow) member of a narrow/wide pair
    ///
    /// Decoding normalizes wide forms to the canonical opcode; width is
    /// reintroduced at link time by the encoding strategy.
    pub fn canonical(self) -> Opcode {
        match self {
            Self::PushConstWide => Self::PushConst,
            Self::LoadLocalWide => Self::LoadLocal,
            Self::StoreLocalWide => Self::StoreLocal,
            Self::LoadGlobalWide => Self::LoadGlobal,
            Self::StoreGlobalWide => Self::StoreGlobal,
            other => other,
        }
    }

    /// Wide member of a narrow/wide pair, if this opcode has one
    pub fn widened(self) -> Option<Opcode> {
        match self {
            Self::PushConst => Some(Self::PushConstWide),
            Self::LoadLocal => Some(Self::LoadLocalWide),
            Self::StoreLocal => Some(Self::StoreLocalWide),
            Self::LoadGlobal => Some(Self::LoadGlobalWide),
            Self::StoreGlobal => Some(Self::StoreGlobalWide),
            _ => None,
        }
    }

    /// Stack effect as (pops, pushes)
    ///
    /// `Call` needs its operand to know the arity; returns None if the
    /// operand is missing.
    pub fn stack_effect(self, arg: Option<u32>) -> Option<(u16, u16)> {
        Some(match self {
            Self::Nop => (0, 0),
            Self::Pop => (1, 0),
            Self::Dup => (1, 2),
            Self::Swap => (2, 2),
            Self::Over => (2, 3),

            Self::PushNil | Self::PushTrue | Self::PushFalse | Self::PushSmall
            | Self::PushConst | Self::PushConstWide => (0, 1),

            Self::LoadLocal | Self::LoadLocalWide => (0, 1),
            Self::StoreLocal | Self::StoreLocalWide => (1, 0),
            Self::LoadGlobal | Self::LoadGlobalWide => (0, 1),
            Self::StoreGlobal | Self::StoreGlobalWide => (1, 0),

            Self::Jump => (0, 0),
            Self::JumpIfFalse | Self::JumpIfTrue => (1, 0),
            Self::Call => {
                let arity = (arg? & 0xFF) as u16;
                (arity, 1)
            }
            Self::Return => (1, 0),
            Self::Halt => (0, 0),

            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod => (2, 1),
            Self::Neg | Self::Abs => (1, 1),
            Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne => (2, 1),
            Self::And | Self::Or | Self::Xor => (2, 1),
            Self::Not => (1, 1),
        })
    }

    /// Get the mnemonic name for this opcode
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Pop => "pop",
            Self::Dup => "dup",
            Self::Swap => "swap",
            Self::Over => "over",
            Self::PushNil => "push_nil",
            Self::PushTrue => "push_true",
            Self::PushFalse => "push_false",
            Self::PushSmall => "push_small",
            Self::PushConst => "push_const",
            Self::PushConstWide => "push_const_wide",
            Self::LoadLocal => "load_local",
            Self::LoadLocalWide => "load_local_wide",
            Self::StoreLocal => "store_local",
            Self::StoreLocalWide => "store_local_wide",
            Self::LoadGlobal => "load_global",
            Self::LoadGlobalWide => "load_global_wide",
            Self::StoreGlobal => "store_global",
            Self::StoreGlobalWide => "store_global_wide",
            Self::Jump => "jump",
            Self::JumpIfFalse => "jump_if_false",
            Self::JumpIfTrue => "jump_if_true",
            Self::Call => "call",
            Self::Return => "return",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::Xor => "xor",
            Self::Halt => "halt",
        }
    }

    /// Check if this opcode is a jump instruction
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(self, Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue)
    }

    /// Check if this opcode is a conditional jump (has a fallthrough edge)
    #[inline]
    pub fn is_conditional_jump(self) -> bool {
        matches!(self, Self::JumpIfFalse | Self::JumpIfTrue)
    }

    /// Check if this opcode terminates execution of the body
    #[inline]
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Return | Self::Halt)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Lookup table for byte -> Opcode conversion
/// This enables O(1) opcode decoding
static OPCODE_TABLE: [Option<Opcode>; 256] = {
    let mut table = [None; 256];

    // Stack operations
    table[0x00] = Some(Opcode::Nop);
    table[0x01] = Some(Opcode::Pop);
    table[0x02] = Some(Opcode::Dup);
    table[0x03] = Some(Opcode::Swap);
    table[0x04] = Some(Opcode::Over);

    // Value creation
    table[0x10] = Some(Opcode::PushNil);
    table[0x11] = Some(Opcode::PushTrue);
    table[0x12] = Some(Opcode::PushFalse);
    table[0x13] = Some(Opcode::PushSmall);
    table[0x14] = Some(Opcode::PushConst);
    table[0x15] = Some(Opcode::PushConstWide);

    // Locals
    table[0x20] = Some(Opcode::LoadLocal);
    table[0x21] = Some(Opcode::LoadLocalWide);
    table[0x22] = Some(Opcode::StoreLocal);
    table[0x23] = Some(Opcode::StoreLocalWide);

    // Globals
    table[0x30] = Some(Opcode::LoadGlobal);
    table[0x31] = Some(Opcode::LoadGlobalWide);
    table[0x32] = Some(Opcode::StoreGlobal);
    table[0x33] = Some(Opcode::StoreGlobalWide);

    // Control flow
    table[0x40] = Some(Opcode::Jump);
    table[0x41] = Some(Opcode::JumpIfFalse);
    table[0x42] = Some(Opcode::JumpIfTrue);
    table[0x48] = Some(Opcode::Call);
    table[0x4C] = Some(Opcode::Return);

    // Arithmetic
    table[0x50] = Some(Opcode::Add);
    table[0x51] = Some(Opcode::Sub);
    table[0x52] = Some(Opcode::Mul);
    table[0x53] = Some(Opcode::Div);
    table[0x54] = Some(Opcode::Mod);
    table[0x55] = Some(Opcode::Neg);
    table[0x56] = Some(Opcode::Abs);

    // Comparison
    table[0x60] = Some(Opcode::Lt);
    table[0x61] = Some(Opcode::Le);
    table[0x62] = Some(Opcode::Gt);
    table[0x63] = Some(Opcode::Ge);
    table[0x64] = Some(Opcode::Eq);
    table[0x65] = Some(Opcode::Ne);

    // Boolean
    table[0x70] = Some(Opcode::And);
    table[0x71] = Some(Opcode::Or);
    table[0x72] = Some(Opcode::Not);
    table[0x73] = Some(Opcode::Xor);

    // Meta
    table[0xFF] = Some(Opcode::Halt);

    table
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for byte in 0u16..=255 {
            if let Some(op) = Opcode::from_byte(byte as u8) {
                assert_eq!(op.to_byte(), byte as u8);
            }
        }
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        assert_eq!(Opcode::from_byte(0x0F), None);
        assert_eq!(Opcode::from_byte(0x49), None);
        assert_eq!(Opcode::from_byte(0xA0), None);
    }

    #[test]
    fn test_immediate_sizes() {
        assert_eq!(Opcode::Add.immediate_size(), 0);
        assert_eq!(Opcode::PushConst.immediate_size(), 1);
        assert_eq!(Opcode::PushConstWide.immediate_size(), 2);
        assert_eq!(Opcode::Jump.immediate_size(), 2);
        assert_eq!(Opcode::Call.immediate_size(), 3);
    }

    #[test]
    fn test_canonical_widen_round_trip() {
        for op in [
            Opcode::PushConst,
            Opcode::LoadLocal,
            Opcode::StoreLocal,
            Opcode::LoadGlobal,
            Opcode::StoreGlobal,
        ] {
            let wide = op.widened().unwrap();
            assert_eq!(wide.canonical(), op);
            assert_eq!(wide.immediate_size(), 2);
            assert_eq!(op.immediate_size(), 1);
        }
        assert_eq!(Opcode::Add.widened(), None);
        assert_eq!(Opcode::Add.canonical(), Opcode::Add);
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Opcode::Add.stack_effect(None), Some((2, 1)));
        assert_eq!(Opcode::Dup.stack_effect(None), Some((1, 2)));
        assert_eq!(Opcode::JumpIfFalse.stack_effect(None), Some((1, 0)));
        assert_eq!(Opcode::Return.stack_effect(None), Some((1, 0)));
        // Call arity is packed in the low byte of the operand
        assert_eq!(Opcode::Call.stack_effect(Some(0x0102)), Some((2, 1)));
        assert_eq!(Opcode::Call.stack_effect(None), None);
    }
}
