//! Code body representation
//!
//! A [`CodeBody`] is the immutable compiled form of one callable: encoded
//! instruction bytes, constant pool, local-slot names, arity, and the
//! maximum operand-stack depth computed by the linker. Code bodies are never
//! mutated after creation; rewriting always produces a new body with a fresh
//! identity. They are freely shared across threads behind `Arc`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gxhash::GxHasher;

use crate::value::Value;
use super::edit::{EditableStream, LinkError};
use super::encoding::InstructionEncoding;
use super::opcodes::Opcode;

/// Process-unique identity of a code body
///
/// Stable for the lifetime of the body; used as the specialization-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(u64);

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

impl CodeId {
    pub(crate) fn fresh() -> Self {
        CodeId(NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// An immutable compiled code body
#[derive(Debug, Clone)]
pub struct CodeBody {
    /// Encoded instruction bytes
    code: Vec<u8>,
    /// Constant pool for values that can't be encoded inline
    constants: Vec<Value>,
    /// Local slot names; slot index = position in this table
    var_names: Vec<Arc<str>>,
    /// Number of parameters; parameters occupy the first slots
    arity: u8,
    /// Maximum operand-stack depth, computed by the linker
    max_stack: u16,
    /// Name of this body (for diagnostics)
    name: String,
    /// Defining source location, consulted by the skip gate
    source_path: Arc<str>,
    /// Process-unique identity
    id: CodeId,
}

impl CodeBody {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_link(
        code: Vec<u8>,
        constants: Vec<Value>,
        var_names: Vec<Arc<str>>,
        arity: u8,
        max_stack: u16,
        name: String,
        source_path: Arc<str>,
    ) -> Self {
        Self {
            code,
            constants,
            var_names,
            arity,
            max_stack,
            name,
            source_path,
            id: CodeId::fresh(),
        }
    }

    /// Get the encoded instruction bytes
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Length of the encoded stream in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the body is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get a byte at the given offset
    #[inline]
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    /// Get an opcode at the given offset
    #[inline]
    pub fn read_opcode(&self, offset: usize) -> Option<Opcode> {
        self.code.get(offset).and_then(|&b| Opcode::from_byte(b))
    }

    /// Read a u16 operand (big-endian)
    #[inline]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        if offset + 1 < self.code.len() {
            Some(u16::from_be_bytes([self.code[offset], self.code[offset + 1]]))
        } else {
            None
        }
    }

    /// Read a signed i16 operand (big-endian)
    #[inline]
    pub fn read_i16(&self, offset: usize) -> Option<i16> {
        self.read_u16(offset).map(|u| u as i16)
    }

    /// Get a constant from the pool
    #[inline]
    pub fn get_constant(&self, index: u32) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    /// Get all constants
    #[inline]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Get the local-slot name table
    #[inline]
    pub fn var_names(&self) -> &[Arc<str>] {
        &self.var_names
    }

    /// Number of local slots
    #[inline]
    pub fn local_count(&self) -> usize {
        self.var_names.len()
    }

    /// Get the arity
    #[inline]
    pub fn arity(&self) -> u8 {
        self.arity
    }

    /// Maximum operand-stack depth at any reachable point
    #[inline]
    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    /// Get the body name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defining source location
    #[inline]
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub(crate) fn source_path_arc(&self) -> Arc<str> {
        Arc::clone(&self.source_path)
    }

    /// Process-unique identity
    #[inline]
    pub fn id(&self) -> CodeId {
        self.id
    }

    /// Structural hash over instructions and tables
    ///
    /// Two bodies with identical content hash equal even though their
    /// [`CodeId`]s differ; used by the link-failure memo.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = GxHasher::with_seed(0);
        self.code.hash(&mut hasher);
        self.constants.hash(&mut hasher);
        self.var_names.hash(&mut hasher);
        self.arity.hash(&mut hasher);
        hasher.finish()
    }

    /// Disassemble the body to a string
    pub fn disassemble(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("=== {} ({}) ===\n", self.name, self.id));
        output.push_str(&format!(
            "arity: {}, locals: {}, max_stack: {}, constants: {}\n",
            self.arity,
            self.var_names.len(),
            self.max_stack,
            self.constants.len()
        ));

        let mut offset = 0;
        while offset < self.code.len() {
            let (disasm, next_offset) = self.disassemble_instruction(offset);
            output.push_str(&format!("{:04x} {}\n", offset, disasm));
            offset = next_offset;
        }

        output
    }

    /// Disassemble a single instruction, returns (string, next_offset)
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let Some(opcode) = self.read_opcode(offset) else {
            return (
                format!("??? (0x{:02x})", self.code.get(offset).copied().unwrap_or(0)),
                offset + 1,
            );
        };

        let imm_size = opcode.immediate_size();
        let next_offset = offset + 1 + imm_size;
        let mnemonic = opcode.mnemonic();

        let operand_str = match imm_size {
            0 => String::new(),
            1 => {
                let byte = self.code.get(offset + 1).copied().unwrap_or(0);
                match opcode {
                    Opcode::PushSmall => format!(" {}", byte as i8),
                    Opcode::PushConst | Opcode::LoadGlobal | Opcode::StoreGlobal => {
                        let const_str = self
                            .constants
                            .get(byte as usize)
                            .map(|c| format!("{}", c))
                            .unwrap_or_else(|| "???".to_string());
                        format!(" #{} ({})", byte, const_str)
                    }
                    Opcode::LoadLocal | Opcode::StoreLocal => {
                        let name = self
                            .var_names
                            .get(byte as usize)
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "???".to_string());
                        format!(" {} ({})", byte, name)
                    }
                    _ => format!(" {}", byte),
                }
            }
            2 => {
                let value = self.read_u16(offset + 1).unwrap_or(0);
                if opcode.is_jump() {
                    let target = (offset as isize + 3 + (value as i16) as isize) as usize;
                    format!(" -> {:04x}", target)
                } else {
                    format!(" {}", value)
                }
            }
            3 => {
                let callee = self.read_u16(offset + 1).unwrap_or(0);
                let arity = self.code.get(offset + 3).copied().unwrap_or(0);
                format!(" #{} arity={}", callee, arity)
            }
            _ => String::new(),
        };

        (format!("{}{}", mnemonic, operand_str), next_offset)
    }
}

/// Builder for constructing code bodies
///
/// Assembles a logical instruction stream with label-based jumps and
/// produces the final [`CodeBody`] through the linker, so every body in the
/// system has been validated by the same dataflow pass.
#[derive(Debug)]
pub struct CodeBuilder {
    name: String,
    source_path: Arc<str>,
    arity: u8,
    constants: Vec<Value>,
    var_names: Vec<Arc<str>>,
    insts: Vec<PendingInst>,
    labels: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy)]
struct PendingInst {
    opcode: Opcode,
    arg: Option<u32>,
    label: Option<Label>,
}

/// Label for a jump target bound later via [`CodeBuilder::bind_label`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

impl CodeBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>, source_path: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            arity: 0,
            constants: Vec::new(),
            var_names: Vec::new(),
            insts: Vec::with_capacity(32),
            labels: Vec::new(),
        }
    }

    /// Set the arity; parameters occupy the first local slots
    pub fn set_arity(&mut self, arity: u8) {
        self.arity = arity;
    }

    /// Add a local slot, returns its index
    pub fn add_local(&mut self, name: impl Into<Arc<str>>) -> u32 {
        let index = self.var_names.len() as u32;
        self.var_names.push(name.into());
        index
    }

    /// Add a constant to the pool, returns its index
    ///
    /// Duplicate constants reuse the existing slot.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        for (i, existing) in self.constants.iter().enumerate() {
            if existing == &value {
                return i as u32;
            }
        }
        let index = self.constants.len() as u32;
        self.constants.push(value);
        index
    }

    /// Emit an opcode with no operand
    pub fn emit(&mut self, opcode: Opcode) {
        self.insts.push(PendingInst { opcode, arg: None, label: None });
    }

    /// Emit an opcode with an operand
    pub fn emit_arg(&mut self, opcode: Opcode, arg: u32) {
        self.insts.push(PendingInst { opcode, arg: Some(arg), label: None });
    }

    /// Emit a constant load
    pub fn emit_constant(&mut self, value: Value) {
        let index = self.add_constant(value);
        self.emit_arg(Opcode::PushConst, index);
    }

    /// Create a fresh, unbound label
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len());
        self.labels.push(None);
        label
    }

    /// Emit a jump to `label`
    pub fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        debug_assert!(opcode.is_jump());
        self.insts.push(PendingInst { opcode, arg: None, label: Some(label) });
    }

    /// Bind a label to the next emitted instruction
    pub fn bind_label(&mut self, label: Label) {
        self.labels[label.0] = Some(self.insts.len());
    }

    /// Emit a call: callee constant index + arity, packed operand
    ///
    /// The callee index must fit 16 bits; larger pools fail at link time.
    pub fn emit_call(&mut self, callee_index: u32, arity: u8) {
        self.emit_arg(Opcode::Call, (callee_index << 8) | arity as u32);
    }

    /// Assemble and link into a validated code body
    pub fn build(self, encoding: &dyn InstructionEncoding) -> Result<Arc<CodeBody>, LinkError> {
        let mut stream = EditableStream::empty(
            self.name,
            self.source_path,
            self.arity,
            self.constants,
            self.var_names,
        );
        // First pass: append instructions, remember each one's id
        let mut ids = Vec::with_capacity(self.insts.len());
        for inst in &self.insts {
            let idx = stream.len();
            ids.push(stream.insert(idx, inst.opcode, inst.arg));
        }
        // Second pass: resolve labels to instruction ids
        for (i, inst) in self.insts.iter().enumerate() {
            if let Some(label) = inst.label {
                let target_index = self.labels[label.0].ok_or(LinkError::UnknownTarget)?;
                let target_id = ids
                    .get(target_index)
                    .copied()
                    .ok_or(LinkError::UnknownTarget)?;
                stream.set_target(i, target_id);
            }
        }
        EditableStream::link(stream, encoding).map(Arc::new)
    }
}
