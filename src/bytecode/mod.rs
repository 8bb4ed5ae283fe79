//! Bytecode representation, editing, and linking
//!
//! Three layers:
//! - [`opcodes`]: the instruction set, one byte per opcode with fixed
//!   immediate sizes and a static decode table
//! - [`code`]: immutable, executable [`CodeBody`] values and the
//!   [`CodeBuilder`] used to assemble them from scratch
//! - [`edit`]: the decode / mutate / relink pipeline that transform
//!   callbacks operate on, with stable jump identity across edits
//!
//! Encoded form: each instruction is an opcode byte followed by zero or
//! more operand bytes. Constant and local operands come in a one-byte
//! narrow form and a two-byte wide form chosen by the active
//! [`InstructionEncoding`]. Jump operands are big-endian `i16` offsets
//! relative to the end of the operand.

pub mod code;
pub mod edit;
pub mod encoding;
pub mod opcodes;

pub use code::{CodeBody, CodeBuilder, CodeId, Label};
pub use edit::{debug_validate, EditableStream, InstrId, Instruction, LinkError};
pub use encoding::{CompactEncoding, EncodedForm, InstructionEncoding, WideEncoding};
pub use opcodes::{ArgKind, Opcode};
