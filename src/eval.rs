//! Call driver
//!
//! The [`Evaluator`] owns a function registry, a global namespace, and
//! handles to the specialization cache and skip set, and runs the full
//! interception protocol for every call it dispatches:
//!
//! 1. skip gate: excluded origins and skip-marked code run directly
//! 2. cache lookup: the first artifact whose guards pass runs in a shadow
//!    frame in place of the original
//! 3. hook callback: on a miss, this thread's callback (if any) is offered
//!    the frame, with the hook suspended for the duration
//! 4. fallback: absent a matching specialization, the original body runs
//!
//! Nested calls made from bytecode re-enter the same protocol, so an
//! entire call tree is intercepted from a single top-level dispatch.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::bytecode::CodeBody;
use crate::cache::SpecializationCache;
use crate::frame::{Frame, Globals};
use crate::hook::{HookController, HookDecision};
use crate::skipfiles::SkipSet;
use crate::value::Value;
use crate::vm::{CallHandler, Interpreter, VmConfig, VmError};

/// Function registry plus the machinery every dispatched call runs through
///
/// Cheap to clone; clones share the registry, globals, cache, and skip set.
#[derive(Debug, Clone)]
pub struct Evaluator {
    functions: Arc<DashMap<String, Arc<CodeBody>>>,
    globals: Globals,
    cache: Arc<SpecializationCache>,
    skip: Arc<SkipSet>,
    config: VmConfig,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    /// An evaluator wired to the process-wide cache and skip set
    pub fn new() -> Self {
        Self {
            functions: Arc::new(DashMap::new()),
            globals: Globals::new(),
            cache: SpecializationCache::global(),
            skip: SkipSet::global(),
            config: VmConfig::default(),
        }
    }

    /// Use an isolated specialization cache
    pub fn with_cache(mut self, cache: Arc<SpecializationCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Use an isolated skip set
    pub fn with_skip_set(mut self, skip: Arc<SkipSet>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a function under a callable name
    pub fn define(&self, name: impl Into<String>, body: Arc<CodeBody>) {
        self.functions.insert(name.into(), body);
    }

    /// The shared global namespace
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// The specialization cache this evaluator consults
    pub fn cache(&self) -> &Arc<SpecializationCache> {
        &self.cache
    }

    /// Call a registered function by name
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        self.call_at_depth(name, args, 0)
    }

    fn call_at_depth(&self, name: &str, args: &[Value], depth: usize) -> Result<Value, VmError> {
        let body = self
            .functions
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VmError::UnknownFunction { name: name.to_string() })?;
        if args.len() != body.arity() as usize {
            return Err(VmError::ArityMismatch {
                name: name.to_string(),
                expected: body.arity(),
                got: args.len(),
            });
        }
        let frame = Frame::for_call(body, args, self.globals.clone());
        self.run_frame(frame, depth)
    }

    /// Run one frame through the interception protocol
    pub fn run_frame(&self, frame: Frame, depth: usize) -> Result<Value, VmError> {
        let code = frame.code().clone();

        if self.skip.contains(code.source_path()) || self.cache.is_skipped(code.id()) {
            trace!(target: "dynatron::eval", code = %code.id(), "skip gate, running directly");
            return self.execute(frame, depth);
        }

        if let Some(specialized) = self.cache.lookup(&frame) {
            let shadow = frame.shadow(specialized);
            return self.execute(shadow, depth);
        }

        let cache_size = self.cache.entry_count(code.id());
        let decision =
            HookController::with_active_suspended(|callback| callback(&frame, cache_size));
        match decision {
            Some(HookDecision::Specialize(artifact)) => {
                let runnable = artifact
                    .matches(&frame.view())
                    .then(|| artifact.code().clone());
                self.cache.insert(code.id(), artifact);
                if let Some(specialized) = runnable {
                    debug!(
                        target: "dynatron::eval",
                        code = %code.id(),
                        specialized = %specialized.id(),
                        "running fresh specialization"
                    );
                    let shadow = frame.shadow(specialized);
                    return self.execute(shadow, depth);
                }
            }
            Some(HookDecision::Skip) => {
                self.cache.mark_skip(code.id());
            }
            Some(HookDecision::Pass) | None => {}
        }

        self.execute(frame, depth)
    }

    fn execute(&self, mut frame: Frame, depth: usize) -> Result<Value, VmError> {
        let nested = self.clone();
        let handler: CallHandler = Arc::new(move |name, args, _globals, call_depth| {
            nested.call_at_depth(name, args, call_depth)
        });
        Interpreter::with_config(self.config.clone())
            .with_call_handler(handler)
            .run_at_depth(&mut frame, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, CompactEncoding, Opcode};

    fn add_body(source: &str) -> Arc<CodeBody> {
        let mut b = CodeBuilder::new("add", source);
        b.set_arity(2);
        b.add_local("a");
        b.add_local("b");
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit_arg(Opcode::LoadLocal, 1);
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        b.build(&CompactEncoding).unwrap()
    }

    fn isolated() -> Evaluator {
        Evaluator::new()
            .with_cache(Arc::new(SpecializationCache::new()))
            .with_skip_set(Arc::new(SkipSet::new()))
    }

    #[test]
    fn test_call_without_hook_runs_original() {
        let eval = isolated();
        eval.define("add", add_body("app/main.rs"));
        assert_eq!(
            eval.call("add", &[Value::Long(3), Value::Long(4)]),
            Ok(Value::Long(7))
        );
    }

    #[test]
    fn test_unknown_function() {
        let eval = isolated();
        assert_eq!(
            eval.call("ghost", &[]),
            Err(VmError::UnknownFunction { name: "ghost".to_string() })
        );
    }

    #[test]
    fn test_arity_mismatch_checked_before_dispatch() {
        let eval = isolated();
        eval.define("add", add_body("app/main.rs"));
        assert_eq!(
            eval.call("add", &[Value::Long(1)]),
            Err(VmError::ArityMismatch {
                name: "add".to_string(),
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_nested_calls_resolve_through_registry() {
        // outer(x) = add(x, 10)
        let eval = isolated();
        eval.define("add", add_body("app/main.rs"));

        let mut b = CodeBuilder::new("outer", "app/main.rs");
        b.set_arity(1);
        b.add_local("x");
        let callee = b.add_constant(Value::str("add"));
        b.emit_arg(Opcode::LoadLocal, 0);
        b.emit_arg(Opcode::PushSmall, 10);
        b.emit_call(callee, 2);
        b.emit(Opcode::Return);
        eval.define("outer", b.build(&CompactEncoding).unwrap());

        assert_eq!(eval.call("outer", &[Value::Long(32)]), Ok(Value::Long(42)));
    }

    #[test]
    fn test_call_depth_limit_applies_to_nesting() {
        // loop_forever() = loop_forever() + 0, recursion must hit the limit
        let eval = isolated().with_config(VmConfig { max_call_depth: 8 });
        let mut b = CodeBuilder::new("spin", "app/main.rs");
        let callee = b.add_constant(Value::str("spin"));
        b.emit_call(callee, 0);
        b.emit(Opcode::Return);
        eval.define("spin", b.build(&CompactEncoding).unwrap());

        assert_eq!(
            eval.call("spin", &[]),
            Err(VmError::CallDepthExceeded { limit: 8 })
        );
    }
}
