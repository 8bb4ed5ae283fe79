//! dynatron: trace-and-specialize execution for a stack bytecode
//!
//! Calls dispatched through the [`eval::Evaluator`] can be intercepted
//! just before execution by a per-thread hook. The hook's callback sees
//! the live frame, may rewrite the callee's bytecode through an editable
//! instruction stream, and attaches guards describing the conditions under
//! which the rewritten body is valid. Specializations are cached per code
//! identity; later calls run the first cached body whose guards pass, and
//! fall back to the original interpretation otherwise.
//!
//! The moving parts:
//! - [`hook`]: per-thread callback slot with scoped install and re-entry
//!   suspension
//! - [`skipfiles`]: origin-prefix opt-out from interception
//! - [`bytecode`]: the instruction set, code bodies, and the decode /
//!   edit / relink pipeline
//! - [`guards`]: validity predicates and guarded artifacts
//! - [`cache`]: the process-wide specialization cache
//! - [`transform`]: the rewrite pipeline packaged for hook use
//! - [`vm`]: the fallback stack interpreter
//! - [`eval`]: the call driver running the whole protocol
//!
//! ```
//! use std::sync::Arc;
//! use dynatron::bytecode::{CodeBuilder, CompactEncoding, Opcode};
//! use dynatron::eval::Evaluator;
//! use dynatron::value::Value;
//!
//! let mut b = CodeBuilder::new("add", "demo/main.rs");
//! b.set_arity(2);
//! b.add_local("a");
//! b.add_local("b");
//! b.emit_arg(Opcode::LoadLocal, 0);
//! b.emit_arg(Opcode::LoadLocal, 1);
//! b.emit(Opcode::Add);
//! b.emit(Opcode::Return);
//!
//! let eval = Evaluator::new();
//! eval.define("add", b.build(&CompactEncoding)?);
//! assert_eq!(eval.call("add", &[Value::Long(3), Value::Long(4)])?, Value::Long(7));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bytecode;
pub mod cache;
pub mod eval;
pub mod frame;
pub mod guards;
pub mod hook;
pub mod skipfiles;
pub mod transform;
pub mod value;
pub mod vm;

pub use bytecode::{CodeBody, CodeBuilder, CodeId, EditableStream, LinkError};
pub use cache::SpecializationCache;
pub use eval::Evaluator;
pub use frame::{Frame, FrameView, Globals};
pub use guards::{evaluate_all, Guard, GuardedArtifact};
pub use hook::{HookCallback, HookController, HookDecision, HookHandle, ReentrantHookError};
pub use skipfiles::{SkipSet, INTERNAL_ORIGIN};
pub use transform::{TransformError, TransformPipeline};
pub use value::{Value, ValueKind};
pub use vm::{Interpreter, VmConfig, VmError};
