//! Operand-width encoding strategies
//!
//! How wide an operand is encoded is a property of the host instruction set,
//! not of the logical program, so width selection is behind a strategy trait.
//! The linker asks the active strategy for the concrete form of every
//! instruction after edits; constant and local indices that outgrow a byte
//! switch to the wide opcode of their pair.

use std::fmt;

use super::edit::LinkError;
use super::opcodes::{ArgKind, Opcode};

/// Concrete encoded form of one logical instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedForm {
    /// The opcode actually emitted (narrow or wide member of a pair)
    pub opcode: Opcode,
    /// Total encoded size in bytes, opcode included
    pub size: usize,
}

/// Strategy choosing the encoded form for each logical instruction
pub trait InstructionEncoding: Send + Sync + fmt::Debug {
    /// Choose the encoded form for `opcode` with operand `arg`.
    ///
    /// `arg` is the logical operand (constant index, local slot, raw
    /// immediate, or packed call spec); jump operands are resolved later and
    /// always occupy two bytes.
    fn select(&self, opcode: Opcode, arg: Option<u32>) -> Result<EncodedForm, LinkError>;
}

fn form(opcode: Opcode) -> EncodedForm {
    EncodedForm {
        opcode,
        size: 1 + opcode.immediate_size(),
    }
}

fn operand(opcode: Opcode, arg: Option<u32>) -> Result<u32, LinkError> {
    arg.ok_or(LinkError::MissingOperand(opcode))
}

/// Default encoding: narrow forms whenever the operand fits in one byte,
/// wide forms up to 16-bit indices
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactEncoding;

impl InstructionEncoding for CompactEncoding {
    fn select(&self, opcode: Opcode, arg: Option<u32>) -> Result<EncodedForm, LinkError> {
        match opcode.arg_kind() {
            ArgKind::None => Ok(form(opcode)),
            ArgKind::Jump => Ok(form(opcode)),
            ArgKind::Immediate => {
                let arg = operand(opcode, arg)?;
                if arg > 0xFF {
                    return Err(LinkError::ArgTooLarge { opcode, arg });
                }
                Ok(form(opcode))
            }
            ArgKind::Const | ArgKind::Local => {
                let arg = operand(opcode, arg)?;
                if arg <= 0xFF {
                    Ok(form(opcode))
                } else if arg <= 0xFFFF {
                    // Every const/local opcode has a wide partner
                    let wide = opcode
                        .widened()
                        .ok_or(LinkError::ArgTooLarge { opcode, arg })?;
                    Ok(form(wide))
                } else {
                    Err(LinkError::ArgTooLarge { opcode, arg })
                }
            }
            ArgKind::Call => {
                let arg = operand(opcode, arg)?;
                // callee index (high 16 bits of the used range) + arity byte
                if arg > 0x00FF_FFFF {
                    return Err(LinkError::ArgTooLarge { opcode, arg });
                }
                Ok(form(opcode))
            }
        }
    }
}

/// Always-wide encoding for hosts without narrow operand forms
#[derive(Debug, Clone, Copy, Default)]
pub struct WideEncoding;

impl InstructionEncoding for WideEncoding {
    fn select(&self, opcode: Opcode, arg: Option<u32>) -> Result<EncodedForm, LinkError> {
        match opcode.arg_kind() {
            ArgKind::Const | ArgKind::Local => {
                let arg = operand(opcode, arg)?;
                if arg > 0xFFFF {
                    return Err(LinkError::ArgTooLarge { opcode, arg });
                }
                let wide = opcode
                    .widened()
                    .ok_or(LinkError::ArgTooLarge { opcode, arg })?;
                Ok(form(wide))
            }
            _ => CompactEncoding.select(opcode, arg),
        }
    }
}
