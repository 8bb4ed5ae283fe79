//! Fallback stack interpreter
//!
//! Executes a [`CodeBody`] directly over a frame. Every intercepted call
//! ends up here eventually: either running a specialized body that passed
//! its guards, or running the original body when no artifact matched or a
//! transform failed. The interpreter trusts nothing about the bytes it
//! reads; malformed streams surface as [`VmError`]s, never as panics.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bytecode::Opcode;
use crate::frame::{Frame, Globals};
use crate::value::{Value, ValueKind};

/// Runtime execution errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Operand stack underflow at the given byte offset
    StackUnderflow { at: usize },
    /// Byte does not decode to an opcode
    InvalidInstruction { at: usize, byte: u8 },
    /// Stream ends inside an instruction
    TruncatedCode { at: usize },
    /// Read of an unbound local slot
    UnboundLocal { name: Arc<str> },
    /// Read of an unbound global
    UnboundGlobal { name: Arc<str> },
    /// Constant-pool index out of bounds, or wrong constant kind
    BadConstant { index: u32 },
    /// Operand kind unsupported by the operation
    TypeMismatch { op: &'static str, found: ValueKind },
    /// Integer division or modulo by zero
    DivisionByZero,
    /// Call with the wrong number of arguments
    ArityMismatch { name: String, expected: u8, got: usize },
    /// Call to a name with no function bound
    UnknownFunction { name: String },
    /// Nested calls exceeded the configured depth limit
    CallDepthExceeded { limit: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow { at } => write!(f, "stack underflow at offset {}", at),
            Self::InvalidInstruction { at, byte } => {
                write!(f, "invalid instruction 0x{:02x} at offset {}", byte, at)
            }
            Self::TruncatedCode { at } => write!(f, "truncated code at offset {}", at),
            Self::UnboundLocal { name } => write!(f, "local variable '{}' is unbound", name),
            Self::UnboundGlobal { name } => write!(f, "global '{}' is not defined", name),
            Self::BadConstant { index } => write!(f, "bad constant index {}", index),
            Self::TypeMismatch { op, found } => {
                write!(f, "unsupported operand kind {:?} for {}", found, op)
            }
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::ArityMismatch { name, expected, got } => write!(
                f,
                "{}() takes {} arguments but {} were given",
                name, expected, got
            ),
            Self::UnknownFunction { name } => write!(f, "unknown function '{}'", name),
            Self::CallDepthExceeded { limit } => {
                write!(f, "call depth limit {} exceeded", limit)
            }
        }
    }
}

impl std::error::Error for VmError {}

/// Handler for nested calls made by executing code
///
/// Receives the callee name, evaluated arguments, the globals of the
/// calling frame, and the nesting depth of the call being made.
pub type CallHandler =
    Arc<dyn Fn(&str, &[Value], &Globals, usize) -> Result<Value, VmError> + Send + Sync>;

/// Interpreter configuration
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum nesting depth for calls made from bytecode
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { max_call_depth: 64 }
    }
}

/// The bytecode interpreter
///
/// Stateless between runs; one instance can execute any number of frames
/// from any number of threads.
#[derive(Clone)]
pub struct Interpreter {
    config: VmConfig,
    call_handler: Option<CallHandler>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self { config: VmConfig::default(), call_handler: None }
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self { config, call_handler: None }
    }

    /// Route nested `call` instructions through `handler`
    pub fn with_call_handler(mut self, handler: CallHandler) -> Self {
        self.call_handler = Some(handler);
        self
    }

    /// Execute a frame to completion
    pub fn run(&self, frame: &mut Frame) -> Result<Value, VmError> {
        self.run_at_depth(frame, 0)
    }

    pub(crate) fn run_at_depth(&self, frame: &mut Frame, depth: usize) -> Result<Value, VmError> {
        let code = frame.code().clone();
        debug!(
            target: "dynatron::vm",
            code = %code.id(),
            name = code.name(),
            depth,
            "executing"
        );

        let bytes = code.code();
        let mut stack: SmallVec<[Value; 16]> =
            SmallVec::with_capacity(code.max_stack() as usize);
        let mut ip = 0usize;

        macro_rules! pop {
            () => {
                stack.pop().ok_or(VmError::StackUnderflow { at: ip })?
            };
        }

        while ip < bytes.len() {
            let at = ip;
            let byte = bytes[ip];
            let opcode = Opcode::from_byte(byte)
                .ok_or(VmError::InvalidInstruction { at, byte })?;
            let imm = opcode.immediate_size();
            if ip + 1 + imm > bytes.len() {
                return Err(VmError::TruncatedCode { at });
            }
            ip += 1 + imm;
            trace!(target: "dynatron::vm", offset = at, op = opcode.mnemonic(), depth = stack.len());

            match opcode {
                Opcode::Nop => {}
                Opcode::Pop => {
                    pop!();
                }
                Opcode::Dup => {
                    let top = stack.last().cloned().ok_or(VmError::StackUnderflow { at })?;
                    stack.push(top);
                }
                Opcode::Swap => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(b);
                    stack.push(a);
                }
                Opcode::Over => {
                    let n = stack.len();
                    if n < 2 {
                        return Err(VmError::StackUnderflow { at });
                    }
                    stack.push(stack[n - 2].clone());
                }

                Opcode::PushNil => stack.push(Value::Nil),
                Opcode::PushTrue => stack.push(Value::Bool(true)),
                Opcode::PushFalse => stack.push(Value::Bool(false)),
                Opcode::PushSmall => stack.push(Value::Long(bytes[at + 1] as i8 as i64)),
                Opcode::PushConst | Opcode::PushConstWide => {
                    let index = read_index(bytes, at, imm);
                    let value = code
                        .get_constant(index)
                        .ok_or(VmError::BadConstant { index })?;
                    stack.push(value.clone());
                }

                Opcode::LoadLocal | Opcode::LoadLocalWide => {
                    let index = read_index(bytes, at, imm) as usize;
                    let value = frame.local(index).cloned().ok_or_else(|| {
                        VmError::UnboundLocal { name: local_name(&code, index) }
                    })?;
                    stack.push(value);
                }
                Opcode::StoreLocal | Opcode::StoreLocalWide => {
                    let index = read_index(bytes, at, imm) as usize;
                    if index >= code.local_count() {
                        return Err(VmError::UnboundLocal { name: local_name(&code, index) });
                    }
                    let value = pop!();
                    frame.set_local(index, value);
                }

                Opcode::LoadGlobal | Opcode::LoadGlobalWide => {
                    let name = const_name(&code, read_index(bytes, at, imm))?;
                    let value = frame
                        .globals()
                        .get(&name)
                        .ok_or(VmError::UnboundGlobal { name })?;
                    stack.push(value);
                }
                Opcode::StoreGlobal | Opcode::StoreGlobalWide => {
                    let name = const_name(&code, read_index(bytes, at, imm))?;
                    let value = pop!();
                    frame.globals().set(name, value);
                }

                Opcode::Jump => {
                    ip = jump_target(bytes, at, ip);
                }
                Opcode::JumpIfFalse => {
                    let cond = pop!();
                    if !cond.is_truthy() {
                        ip = jump_target(bytes, at, ip);
                    }
                }
                Opcode::JumpIfTrue => {
                    let cond = pop!();
                    if cond.is_truthy() {
                        ip = jump_target(bytes, at, ip);
                    }
                }

                Opcode::Call => {
                    let index = u16::from_be_bytes([bytes[at + 1], bytes[at + 2]]) as u32;
                    let arity = bytes[at + 3] as usize;
                    let name = const_name(&code, index)?;
                    if depth + 1 > self.config.max_call_depth {
                        return Err(VmError::CallDepthExceeded {
                            limit: self.config.max_call_depth,
                        });
                    }
                    if stack.len() < arity {
                        return Err(VmError::StackUnderflow { at });
                    }
                    let args: SmallVec<[Value; 4]> =
                        stack.drain(stack.len() - arity..).collect();
                    let handler = self.call_handler.as_ref().ok_or_else(|| {
                        VmError::UnknownFunction { name: name.to_string() }
                    })?;
                    let result = handler(&name, &args, frame.globals(), depth + 1)?;
                    stack.push(result);
                }
                Opcode::Return => {
                    let value = pop!();
                    trace!(target: "dynatron::vm", code = %code.id(), result = %value, "return");
                    return Ok(value);
                }

                Opcode::Add => binary_long(&mut stack, at, "+", |a, b| Ok(a + b))?,
                Opcode::Sub => binary_long(&mut stack, at, "-", |a, b| Ok(a - b))?,
                Opcode::Mul => binary_long(&mut stack, at, "*", |a, b| Ok(a * b))?,
                Opcode::Div => binary_long(&mut stack, at, "/", |a, b| {
                    if b == 0 {
                        Err(VmError::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                })?,
                Opcode::Mod => binary_long(&mut stack, at, "%", |a, b| {
                    if b == 0 {
                        Err(VmError::DivisionByZero)
                    } else {
                        Ok(a % b)
                    }
                })?,
                Opcode::Neg => {
                    let v = pop!();
                    match v {
                        Value::Long(n) => stack.push(Value::Long(-n)),
                        other => {
                            return Err(VmError::TypeMismatch { op: "neg", found: other.kind() })
                        }
                    }
                }
                Opcode::Abs => {
                    let v = pop!();
                    match v {
                        Value::Long(n) => stack.push(Value::Long(n.abs())),
                        other => {
                            return Err(VmError::TypeMismatch { op: "abs", found: other.kind() })
                        }
                    }
                }

                Opcode::Lt => compare_long(&mut stack, at, "<", |a, b| a < b)?,
                Opcode::Le => compare_long(&mut stack, at, "<=", |a, b| a <= b)?,
                Opcode::Gt => compare_long(&mut stack, at, ">", |a, b| a > b)?,
                Opcode::Ge => compare_long(&mut stack, at, ">=", |a, b| a >= b)?,
                Opcode::Eq => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Bool(a == b));
                }
                Opcode::Ne => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Bool(a != b));
                }

                Opcode::And => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Opcode::Or => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }
                Opcode::Xor => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(Value::Bool(a.is_truthy() != b.is_truthy()));
                }
                Opcode::Not => {
                    let v = pop!();
                    stack.push(Value::Bool(!v.is_truthy()));
                }

                Opcode::Halt => return Ok(Value::Nil),
            }
        }

        // Linked bodies cannot fall through; raw bodies might
        Err(VmError::TruncatedCode { at: bytes.len() })
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("config", &self.config)
            .field("call_handler", &self.call_handler.is_some())
            .finish()
    }
}

#[inline]
fn read_index(bytes: &[u8], at: usize, imm: usize) -> u32 {
    match imm {
        1 => bytes[at + 1] as u32,
        _ => u16::from_be_bytes([bytes[at + 1], bytes[at + 2]]) as u32,
    }
}

#[inline]
fn jump_target(bytes: &[u8], at: usize, after: usize) -> usize {
    let rel = i16::from_be_bytes([bytes[at + 1], bytes[at + 2]]) as isize;
    (after as isize + rel) as usize
}

fn local_name(code: &crate::bytecode::CodeBody, index: usize) -> Arc<str> {
    code.var_names()
        .get(index)
        .cloned()
        .unwrap_or_else(|| Arc::from(format!("<slot {}>", index)))
}

fn const_name(code: &crate::bytecode::CodeBody, index: u32) -> Result<Arc<str>, VmError> {
    match code.get_constant(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(VmError::BadConstant { index }),
    }
}

fn binary_long(
    stack: &mut SmallVec<[Value; 16]>,
    at: usize,
    op: &'static str,
    f: impl FnOnce(i64, i64) -> Result<i64, VmError>,
) -> Result<(), VmError> {
    let b = stack.pop().ok_or(VmError::StackUnderflow { at })?;
    let a = stack.pop().ok_or(VmError::StackUnderflow { at })?;
    match (a, b) {
        (Value::Long(a), Value::Long(b)) => {
            stack.push(Value::Long(f(a, b)?));
            Ok(())
        }
        (Value::Long(_), other) | (other, _) => {
            Err(VmError::TypeMismatch { op, found: other.kind() })
        }
    }
}

fn compare_long(
    stack: &mut SmallVec<[Value; 16]>,
    at: usize,
    op: &'static str,
    f: impl FnOnce(i64, i64) -> bool,
) -> Result<(), VmError> {
    let b = stack.pop().ok_or(VmError::StackUnderflow { at })?;
    let a = stack.pop().ok_or(VmError::StackUnderflow { at })?;
    match (a, b) {
        (Value::Long(a), Value::Long(b)) => {
            stack.push(Value::Bool(f(a, b)));
            Ok(())
        }
        (Value::Long(_), other) | (other, _) => {
            Err(VmError::TypeMismatch { op, found: other.kind() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, CompactEncoding};

    fn run(builder: CodeBuilder, args: &[Value]) -> Result<Value, VmError> {
        let body = builder.build(&CompactEncoding).unwrap();
        let mut frame = Frame::for_call(body, args, Globals::new());
        Interpreter::new().run(&mut frame)
    }

    #[test]
    fn test_add_two_args() {
        let mut b = CodeBuilder::new("add", "<test>");
        b.set_arity(2);
        b.add_local("a");
        b.add_local("b");
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit_arg(Opcode::LoadLocal, 1);
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        assert_eq!(run(b, &[Value::Long(3), Value::Long(4)]), Ok(Value::Long(7)));
    }

    #[test]
    fn test_unbound_local_is_an_error() {
        let mut b = CodeBuilder::new("oops", "<test>");
        b.add_local("x");
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit(Opcode::Return);
        assert_eq!(
            run(b, &[]),
            Err(VmError::UnboundLocal { name: Arc::from("x") })
        );
    }

    #[test]
    fn test_division_by_zero() {
        let mut b = CodeBuilder::new("div0", "<test>");
        b.emit_arg(Opcode::PushSmall, 1);
        b.emit_arg(Opcode::PushSmall, 0);
        b.emit(Opcode::Div);
        b.emit(Opcode::Return);
        assert_eq!(run(b, &[]), Err(VmError::DivisionByZero));
    }

    #[test]
    fn test_type_mismatch_for_add() {
        let mut b = CodeBuilder::new("mixed", "<test>");
        b.emit_arg(Opcode::PushSmall, 1);
        b.emit(Opcode::PushTrue);
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        assert_eq!(
            run(b, &[]),
            Err(VmError::TypeMismatch { op: "+", found: ValueKind::Bool })
        );
    }

    #[test]
    fn test_countdown_loop() {
        // sum = 0; while n: sum += n; n -= 1; return sum
        let mut b = CodeBuilder::new("sum_to", "<test>");
        b.set_arity(1);
        b.add_local("n");
        b.add_local("sum");
        let top = b.new_label();
        let out = b.new_label();
        b.emit_arg(Opcode::PushSmall, 0);
        b.emit_arg(Opcode::StoreLocal, 1);
        b.bind_label(top);
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit_jump(Opcode::JumpIfFalse, out);
        b.emit_arg(Opcode::LoadLocal, 1);
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit(Opcode::Add);
        b.emit_arg(Opcode::StoreLocal, 1);
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit_arg(Opcode::PushSmall, 1);
        b.emit(Opcode::Sub);
        b.emit_arg(Opcode::StoreLocal, 0);
        b.emit_jump(Opcode::Jump, top);
        b.bind_label(out);
        b.emit_arg(Opcode::LoadLocal, 1);
        b.emit(Opcode::Return);
        assert_eq!(run(b, &[Value::Long(5)]), Ok(Value::Long(15)));
    }

    #[test]
    fn test_globals_load_and_store() {
        let mut b = CodeBuilder::new("bump", "<test>");
        let name = b.add_constant(Value::str("counter"));
        b.emit_arg(Opcode::LoadGlobal, name);
        b.emit_arg(Opcode::PushSmall, 1);
        b.emit(Opcode::Add);
        b.emit(Opcode::Dup);
        b.emit_arg(Opcode::StoreGlobal, name);
        b.emit(Opcode::Return);
        let body = b.build(&CompactEncoding).unwrap();

        let globals = Globals::new();
        globals.set("counter", Value::Long(41));
        let mut frame = Frame::for_call(body, &[], globals.clone());
        assert_eq!(Interpreter::new().run(&mut frame), Ok(Value::Long(42)));
        assert_eq!(globals.get("counter"), Some(Value::Long(42)));
    }

    #[test]
    fn test_call_through_handler() {
        let mut b = CodeBuilder::new("caller", "<test>");
        let callee = b.add_constant(Value::str("twice"));
        b.emit_arg(Opcode::PushSmall, 21);
        b.emit_call(callee, 1);
        b.emit(Opcode::Return);
        let body = b.build(&CompactEncoding).unwrap();

        let handler: CallHandler = Arc::new(|name, args, _globals, _depth| {
            assert_eq!(name, "twice");
            match args {
                [Value::Long(n)] => Ok(Value::Long(n * 2)),
                _ => Err(VmError::UnknownFunction { name: name.to_string() }),
            }
        });
        let mut frame = Frame::for_call(body, &[], Globals::new());
        let vm = Interpreter::new().with_call_handler(handler);
        assert_eq!(vm.run(&mut frame), Ok(Value::Long(42)));
    }

    #[test]
    fn test_call_without_handler_is_unknown() {
        let mut b = CodeBuilder::new("caller", "<test>");
        let callee = b.add_constant(Value::str("ghost"));
        b.emit_call(callee, 0);
        b.emit(Opcode::Return);
        let body = b.build(&CompactEncoding).unwrap();
        let mut frame = Frame::for_call(body, &[], Globals::new());
        assert_eq!(
            Interpreter::new().run(&mut frame),
            Err(VmError::UnknownFunction { name: "ghost".to_string() })
        );
    }
}
