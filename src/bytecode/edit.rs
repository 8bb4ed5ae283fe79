//! Editable instruction streams and the linker
//!
//! The mutation surface handed to transform callbacks. A [`CodeBody`]'s
//! encoded bytes are decoded into an ordered, index-addressable sequence of
//! [`Instruction`] records; jumps refer to their targets by stable logical
//! id rather than byte offset, so arbitrary insertions, deletions, and
//! reorderings keep each control transfer pointed at its original target.
//!
//! [`EditableStream::link`] turns the edited stream back into an executable
//! body: it re-runs the stack-depth dataflow, re-selects operand widths via
//! the active encoding strategy, lays out byte positions, and re-emits jump
//! offsets. Any inconsistency aborts the link with a [`LinkError`]; the
//! specialization attempt is abandoned and the call falls back, never the
//! call itself.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::value::Value;
use super::code::CodeBody;
use super::encoding::InstructionEncoding;
use super::opcodes::{ArgKind, Opcode};

/// Errors produced while decoding, validating, or linking a stream
///
/// These abort the specialization attempt, not the intercepted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Byte does not decode to any opcode
    InvalidOpcode(u8),
    /// Encoded stream ends inside an operand
    Truncated,
    /// Jump has no resolvable target instruction
    UnknownTarget,
    /// Decoded jump lands outside the stream or between instructions
    TargetOutOfBounds(usize),
    /// Operand stack would underflow at the given instruction index
    StackUnderflow { at: usize },
    /// Divergent paths reach the same instruction at different stack heights
    InconsistentDepth { at: usize, a: u16, b: u16 },
    /// Relative jump distance does not fit the offset encoding
    JumpOutOfRange { at: usize },
    /// Operand does not fit any supported encoding
    ArgTooLarge { opcode: Opcode, arg: u32 },
    /// Opcode requires an operand but none was supplied
    MissingOperand(Opcode),
    /// Constant-pool index out of bounds
    InvalidConstant(u32),
    /// Local-slot index out of bounds
    InvalidLocal(u32),
    /// Arity exceeds the local-slot table
    BadArity { arity: u8, locals: usize },
    /// Execution can run off the end of the stream
    NoReturn,
    /// Diagnostic consistency check failed
    ValidationFailed(&'static str),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOpcode(b) => write!(f, "invalid opcode: 0x{:02x}", b),
            Self::Truncated => write!(f, "encoded stream truncated inside an operand"),
            Self::UnknownTarget => write!(f, "jump target is unresolved"),
            Self::TargetOutOfBounds(off) => {
                write!(f, "jump target 0x{:04x} is not an instruction boundary", off)
            }
            Self::StackUnderflow { at } => {
                write!(f, "operand stack underflow at instruction {}", at)
            }
            Self::InconsistentDepth { at, a, b } => write!(
                f,
                "inconsistent stack depth at instruction {}: {} vs {}",
                at, a, b
            ),
            Self::JumpOutOfRange { at } => {
                write!(f, "jump at instruction {} exceeds offset range", at)
            }
            Self::ArgTooLarge { opcode, arg } => {
                write!(f, "operand {} does not fit any encoding of {}", arg, opcode)
            }
            Self::MissingOperand(op) => write!(f, "{} requires an operand", op),
            Self::InvalidConstant(i) => write!(f, "invalid constant index: {}", i),
            Self::InvalidLocal(i) => write!(f, "invalid local index: {}", i),
            Self::BadArity { arity, locals } => {
                write!(f, "arity {} exceeds {} local slots", arity, locals)
            }
            Self::NoReturn => write!(f, "execution can run off the end of the stream"),
            Self::ValidationFailed(what) => write!(f, "validation failed: {}", what),
        }
    }
}

impl std::error::Error for LinkError {}

/// Stable logical identity of one instruction within a stream
///
/// Survives insertions and deletions around the instruction, which is what
/// lets jumps track their original targets through arbitrary edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(u32);

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Stable id within the owning stream
    pub id: InstrId,
    /// Canonical opcode (wide forms are normalized at decode)
    pub opcode: Opcode,
    /// Logical operand: constant index, local slot, raw immediate, or
    /// packed call spec
    pub arg: Option<u32>,
    /// Jump target by instruction id
    pub target: Option<InstrId>,
}

/// An editable, index-addressable instruction stream plus its code options
/// (constant pool, local-slot names, arity, name, source location)
#[derive(Debug, Clone)]
pub struct EditableStream {
    name: String,
    source_path: Arc<str>,
    arity: u8,
    constants: Vec<Value>,
    var_names: Vec<Arc<str>>,
    insts: Vec<Instruction>,
    next_id: u32,
}

impl EditableStream {
    pub(crate) fn empty(
        name: String,
        source_path: Arc<str>,
        arity: u8,
        constants: Vec<Value>,
        var_names: Vec<Arc<str>>,
    ) -> Self {
        Self {
            name,
            source_path,
            arity,
            constants,
            var_names,
            insts: Vec::new(),
            next_id: 0,
        }
    }

    /// Decode a code body into an editable stream
    pub fn from_code(body: &CodeBody) -> Result<Self, LinkError> {
        let bytes = body.code();
        let mut stream = Self::empty(
            body.name().to_string(),
            body.source_path_arc(),
            body.arity(),
            body.constants().to_vec(),
            body.var_names().to_vec(),
        );

        // offset of each instruction start -> its index
        let mut starts: HashMap<usize, usize> = HashMap::new();
        // (instruction index, absolute target byte offset)
        let mut pending_jumps: SmallVec<[(usize, usize); 8]> = SmallVec::new();

        let mut offset = 0;
        while offset < bytes.len() {
            let byte = bytes[offset];
            let opcode = Opcode::from_byte(byte).ok_or(LinkError::InvalidOpcode(byte))?;
            let imm = opcode.immediate_size();
            if offset + 1 + imm > bytes.len() {
                return Err(LinkError::Truncated);
            }
            starts.insert(offset, stream.insts.len());

            let mut arg = None;
            match opcode.arg_kind() {
                ArgKind::None => {}
                ArgKind::Immediate => arg = Some(bytes[offset + 1] as u32),
                ArgKind::Const | ArgKind::Local => {
                    arg = Some(match imm {
                        1 => bytes[offset + 1] as u32,
                        _ => u16::from_be_bytes([bytes[offset + 1], bytes[offset + 2]]) as u32,
                    });
                }
                ArgKind::Jump => {
                    let rel =
                        i16::from_be_bytes([bytes[offset + 1], bytes[offset + 2]]) as isize;
                    let after = (offset + 3) as isize;
                    let target = after + rel;
                    if target < 0 {
                        return Err(LinkError::TargetOutOfBounds(0));
                    }
                    pending_jumps.push((stream.insts.len(), target as usize));
                }
                ArgKind::Call => {
                    let callee =
                        u16::from_be_bytes([bytes[offset + 1], bytes[offset + 2]]) as u32;
                    let arity = bytes[offset + 3] as u32;
                    arg = Some((callee << 8) | arity);
                }
            }

            let id = stream.fresh_id();
            stream.insts.push(Instruction {
                id,
                opcode: opcode.canonical(),
                arg,
                target: None,
            });
            offset += 1 + imm;
        }

        for (index, target_offset) in pending_jumps {
            let target_index = *starts
                .get(&target_offset)
                .ok_or(LinkError::TargetOutOfBounds(target_offset))?;
            let target_id = stream.insts[target_index].id;
            stream.insts[index].target = Some(target_id);
        }

        Ok(stream)
    }

    fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Number of instructions
    #[inline]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Check if the stream has no instructions
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Get an instruction by index
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.insts.get(index)
    }

    /// All instructions in order
    pub fn instructions(&self) -> &[Instruction] {
        &self.insts
    }

    /// Insert a new instruction before `index`, returns its id
    pub fn insert(&mut self, index: usize, opcode: Opcode, arg: Option<u32>) -> InstrId {
        let id = self.fresh_id();
        self.insts.insert(
            index,
            Instruction { id, opcode: opcode.canonical(), arg, target: None },
        );
        id
    }

    /// Insert a jump before `index` aimed at an existing instruction
    pub fn insert_jump(&mut self, index: usize, opcode: Opcode, target: InstrId) -> InstrId {
        debug_assert!(opcode.is_jump());
        let id = self.fresh_id();
        self.insts.insert(
            index,
            Instruction { id, opcode, arg: None, target: Some(target) },
        );
        id
    }

    /// Remove and return the instruction at `index`
    ///
    /// Jumps aimed at the removed instruction become unresolved and will
    /// fail the next link.
    pub fn remove(&mut self, index: usize) -> Instruction {
        self.insts.remove(index)
    }

    /// Replace opcode and operand at `index`, keeping the id and target
    pub fn replace(&mut self, index: usize, opcode: Opcode, arg: Option<u32>) {
        let inst = &mut self.insts[index];
        inst.opcode = opcode.canonical();
        inst.arg = arg;
    }

    /// Point the instruction at `index` at a new jump target
    pub fn set_target(&mut self, index: usize, target: InstrId) {
        self.insts[index].target = Some(target);
    }

    /// Id of the instruction at `index`
    pub fn id_at(&self, index: usize) -> Option<InstrId> {
        self.insts.get(index).map(|i| i.id)
    }

    /// Index of the instruction with the given id
    pub fn index_of(&self, id: InstrId) -> Option<usize> {
        self.insts.iter().position(|i| i.id == id)
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

    /// Add a local slot, returns its index
    pub fn add_local(&mut self, name: impl Into<Arc<str>>) -> u32 {
        let index = self.var_names.len() as u32;
        self.var_names.push(name.into());
        index
    }

    /// Find a local slot by name
    pub fn local_index(&self, name: &str) -> Option<u32> {
        self.var_names
            .iter()
            .position(|n| n.as_ref() == name)
            .map(|i| i as u32)
    }

    /// Get the constant pool
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Get the local-slot name table
    pub fn var_names(&self) -> &[Arc<str>] {
        &self.var_names
    }

    /// Declared arity
    pub fn arity(&self) -> u8 {
        self.arity
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the stream (and the body produced from it)
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Change the source path carried by the linked body
    pub fn set_source_path(&mut self, path: impl Into<Arc<str>>) {
        self.source_path = path.into();
    }

    /// Link the edited stream into a new executable code body
    ///
    /// Recomputes, in order: stack-depth dataflow over the logical stream
    /// (also yielding `max_stack`), operand widths via `encoding`, byte
    /// positions, and relative jump offsets.
    pub fn link(self, encoding: &dyn InstructionEncoding) -> Result<CodeBody, LinkError> {
        if self.arity as usize > self.var_names.len() {
            return Err(LinkError::BadArity {
                arity: self.arity,
                locals: self.var_names.len(),
            });
        }
        if self.insts.is_empty() {
            return Err(LinkError::NoReturn);
        }

        let index_of: HashMap<InstrId, usize> = self
            .insts
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.id, i))
            .collect();

        let max_stack = self.stack_dataflow(&index_of)?;

        // Width selection, independent of layout: widths depend only on
        // operand magnitude, never on where the instruction lands.
        let mut forms = Vec::with_capacity(self.insts.len());
        for inst in &self.insts {
            forms.push(encoding.select(inst.opcode, inst.arg)?);
        }

        // Byte positions
        let mut positions = Vec::with_capacity(self.insts.len());
        let mut pos = 0usize;
        for f in &forms {
            positions.push(pos);
            pos += f.size;
        }

        // Emission
        let mut code = Vec::with_capacity(pos);
        for (i, (inst, f)) in self.insts.iter().zip(&forms).enumerate() {
            code.push(f.opcode.to_byte());
            match inst.opcode.arg_kind() {
                ArgKind::None => {}
                ArgKind::Immediate => {
                    let arg = inst.arg.ok_or(LinkError::MissingOperand(inst.opcode))?;
                    code.push(arg as u8);
                }
                ArgKind::Const | ArgKind::Local => {
                    let arg = inst.arg.ok_or(LinkError::MissingOperand(inst.opcode))?;
                    let limit = if inst.opcode.arg_kind() == ArgKind::Const {
                        self.constants.len()
                    } else {
                        self.var_names.len()
                    };
                    if arg as usize >= limit {
                        return Err(if inst.opcode.arg_kind() == ArgKind::Const {
                            LinkError::InvalidConstant(arg)
                        } else {
                            LinkError::InvalidLocal(arg)
                        });
                    }
                    match f.size - 1 {
                        1 => code.push(arg as u8),
                        _ => code.extend_from_slice(&(arg as u16).to_be_bytes()),
                    }
                }
                ArgKind::Jump => {
                    let target = inst.target.ok_or(LinkError::UnknownTarget)?;
                    let target_index =
                        *index_of.get(&target).ok_or(LinkError::UnknownTarget)?;
                    let after = positions[i] + 3;
                    let rel = positions[target_index] as i64 - after as i64;
                    let rel = i16::try_from(rel)
                        .map_err(|_| LinkError::JumpOutOfRange { at: i })?;
                    code.extend_from_slice(&rel.to_be_bytes());
                }
                ArgKind::Call => {
                    let arg = inst.arg.ok_or(LinkError::MissingOperand(inst.opcode))?;
                    let callee = (arg >> 8) as u32;
                    if callee as usize >= self.constants.len() {
                        return Err(LinkError::InvalidConstant(callee));
                    }
                    code.extend_from_slice(&(callee as u16).to_be_bytes());
                    code.push(arg as u8);
                }
            }
        }

        Ok(CodeBody::from_link(
            code,
            self.constants,
            self.var_names,
            self.arity,
            max_stack,
            self.name,
            self.source_path,
        ))
    }

    /// Forward dataflow over stack heights
    ///
    /// Tracks the operand-stack depth into every reachable instruction
    /// across fallthrough and jump edges. Fails on underflow, on divergent
    /// paths meeting at different heights, on unresolved targets, and on
    /// reachable fallthrough past the end of the stream.
    fn stack_dataflow(&self, index_of: &HashMap<InstrId, usize>) -> Result<u16, LinkError> {
        let n = self.insts.len();
        let mut depth_in: Vec<Option<u16>> = vec![None; n];
        let mut worklist: SmallVec<[(usize, u16); 16]> = SmallVec::new();
        worklist.push((0, 0));
        let mut max_depth: u16 = 0;

        while let Some((i, depth)) = worklist.pop() {
            match depth_in[i] {
                Some(seen) if seen == depth => continue,
                Some(seen) => {
                    return Err(LinkError::InconsistentDepth { at: i, a: seen, b: depth })
                }
                None => depth_in[i] = Some(depth),
            }
            max_depth = max_depth.max(depth);

            let inst = &self.insts[i];
            let (pops, pushes) = inst
                .opcode
                .stack_effect(inst.arg)
                .ok_or(LinkError::MissingOperand(inst.opcode))?;
            if depth < pops {
                return Err(LinkError::StackUnderflow { at: i });
            }
            let after = depth - pops + pushes;
            max_depth = max_depth.max(after);

            if inst.opcode.is_terminator() {
                continue;
            }
            if inst.opcode.is_jump() {
                let target = inst.target.ok_or(LinkError::UnknownTarget)?;
                let target_index = *index_of.get(&target).ok_or(LinkError::UnknownTarget)?;
                worklist.push((target_index, after));
                if !inst.opcode.is_conditional_jump() {
                    continue;
                }
            }
            // Fallthrough edge
            if i + 1 >= n {
                return Err(LinkError::NoReturn);
            }
            worklist.push((i + 1, after));
        }

        Ok(max_depth)
    }
}

/// Diagnostic consistency check between an original body and its relinked
/// counterpart
///
/// Used before and after linking for debugging; has no effect on the main
/// path.
pub fn debug_validate(original: &CodeBody, linked: &CodeBody) -> Result<(), LinkError> {
    if linked.arity() != original.arity() {
        return Err(LinkError::ValidationFailed("arity changed"));
    }
    if linked.local_count() < original.local_count() {
        return Err(LinkError::ValidationFailed("local slots dropped"));
    }
    if linked.constants().len() < original.constants().len() {
        return Err(LinkError::ValidationFailed("constants dropped"));
    }
    // The linked stream must decode cleanly back into instructions
    let stream = EditableStream::from_code(linked)?;
    if stream.is_empty() {
        return Err(LinkError::ValidationFailed("empty instruction stream"));
    }
    Ok(())
}
