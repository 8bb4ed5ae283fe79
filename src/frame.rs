//! Call frames and the global namespace
//!
//! A [`Frame`] is one activation about to execute: the callee's code body,
//! its local slots, and a handle to the shared global namespace. The hook
//! intercepts frames before execution; guards inspect them through the
//! read-only [`FrameView`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::bytecode::{CodeBody, CodeId};
use crate::value::Value;

/// Shared mutable global namespace
///
/// Cheap to clone; all clones observe the same bindings.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    inner: Arc<RwLock<HashMap<Arc<str>, Value>>>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a binding by name
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().get(name).cloned()
    }

    /// Bind or rebind a name
    pub fn set(&self, name: impl Into<Arc<str>>, value: Value) {
        self.inner.write().insert(name.into(), value);
    }

    /// Check whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }
}

/// One activation record
///
/// Local slots are positional and may be unbound; reading an unbound slot
/// during execution is an error, not a default value.
#[derive(Debug, Clone)]
pub struct Frame {
    code: Arc<CodeBody>,
    locals: SmallVec<[Option<Value>; 8]>,
    globals: Globals,
}

impl Frame {
    /// Build a frame for a call: arguments fill the leading local slots,
    /// remaining slots start unbound
    ///
    /// The caller is responsible for arity checking before construction.
    pub fn for_call(code: Arc<CodeBody>, args: &[Value], globals: Globals) -> Self {
        debug_assert_eq!(args.len(), code.arity() as usize);
        let mut locals: SmallVec<[Option<Value>; 8]> =
            SmallVec::with_capacity(code.local_count());
        locals.extend(args.iter().cloned().map(Some));
        locals.resize(code.local_count(), None);
        Self { code, locals, globals }
    }

    /// Build a shadow frame running `code` in place of this frame's code
    ///
    /// Locals are copied by slot index; the replacement body may declare
    /// more slots than the original, and the extras start unbound.
    pub fn shadow(&self, code: Arc<CodeBody>) -> Self {
        let mut locals: SmallVec<[Option<Value>; 8]> =
            SmallVec::with_capacity(code.local_count());
        let shared = self.locals.len().min(code.local_count());
        locals.extend(self.locals[..shared].iter().cloned());
        locals.resize(code.local_count(), None);
        Self { code, locals, globals: self.globals.clone() }
    }

    /// The code body this frame executes
    pub fn code(&self) -> &Arc<CodeBody> {
        &self.code
    }

    /// Read a local slot; `None` for out-of-range or unbound slots
    pub fn local(&self, index: usize) -> Option<&Value> {
        self.locals.get(index).and_then(|slot| slot.as_ref())
    }

    /// Write a local slot
    pub(crate) fn set_local(&mut self, index: usize, value: Value) {
        self.locals[index] = Some(value);
    }

    /// The shared global namespace
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Read-only view for guard evaluation
    pub fn view(&self) -> FrameView<'_> {
        FrameView { frame: self }
    }
}

/// Read-only window onto a frame, handed to guard predicates
///
/// Exposes inspection only; guards cannot mutate the frame they judge.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    frame: &'a Frame,
}

impl<'a> FrameView<'a> {
    /// Identity of the code body under this frame
    pub fn code_id(&self) -> CodeId {
        self.frame.code.id()
    }

    /// Declared arity of the callee
    pub fn arity(&self) -> u8 {
        self.frame.code.arity()
    }

    /// Total local slots, arguments included
    pub fn local_count(&self) -> usize {
        self.frame.code.local_count()
    }

    /// Read a local slot by index
    pub fn local(&self, index: usize) -> Option<&'a Value> {
        self.frame.local(index)
    }

    /// Read a local slot by declared name
    pub fn local_by_name(&self, name: &str) -> Option<&'a Value> {
        let index = self
            .frame
            .code
            .var_names()
            .iter()
            .position(|n| n.as_ref() == name)?;
        self.frame.local(index)
    }

    /// Read a global binding
    pub fn global(&self, name: &str) -> Option<Value> {
        self.frame.globals.get(name)
    }

    /// Source path of the callee's code
    pub fn source_path(&self) -> &str {
        self.frame.code.source_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, CompactEncoding, Opcode};

    fn two_arg_body() -> Arc<CodeBody> {
        let mut builder = CodeBuilder::new("f", "<test>");
        builder.set_arity(2);
        builder.add_local("a");
        builder.add_local("b");
        builder.add_local("tmp");
        builder.emit_arg(Opcode::LoadLocal, 0);
        builder.emit(Opcode::Return);
        builder.build(&CompactEncoding).unwrap()
    }

    #[test]
    fn test_for_call_binds_args_leaves_rest_unbound() {
        let body = two_arg_body();
        let frame = Frame::for_call(body, &[Value::Long(5), Value::Long(6)], Globals::new());
        assert_eq!(frame.local(0), Some(&Value::Long(5)));
        assert_eq!(frame.local(1), Some(&Value::Long(6)));
        assert_eq!(frame.local(2), None);
        assert_eq!(frame.local(99), None);
    }

    #[test]
    fn test_shadow_copies_by_index() {
        let body = two_arg_body();
        let frame = Frame::for_call(
            body.clone(),
            &[Value::Long(1), Value::Long(2)],
            Globals::new(),
        );

        // Replacement body declares an extra slot
        let mut builder = CodeBuilder::new("f'", "<test>");
        builder.set_arity(2);
        builder.add_local("a");
        builder.add_local("b");
        builder.add_local("tmp");
        builder.add_local("extra");
        builder.emit_arg(Opcode::LoadLocal, 1);
        builder.emit(Opcode::Return);
        let wider = builder.build(&CompactEncoding).unwrap();

        let shadow = frame.shadow(wider);
        assert_eq!(shadow.local(0), Some(&Value::Long(1)));
        assert_eq!(shadow.local(1), Some(&Value::Long(2)));
        assert_eq!(shadow.local(3), None);
    }

    #[test]
    fn test_view_reads_by_name_and_globals() {
        let body = two_arg_body();
        let globals = Globals::new();
        globals.set("limit", Value::Long(10));
        let frame = Frame::for_call(body, &[Value::Long(7), Value::Bool(true)], globals);

        let view = frame.view();
        assert_eq!(view.arity(), 2);
        assert_eq!(view.local_by_name("a"), Some(&Value::Long(7)));
        assert_eq!(view.local_by_name("tmp"), None);
        assert_eq!(view.global("limit"), Some(Value::Long(10)));
        assert_eq!(view.global("missing"), None);
    }

    #[test]
    fn test_globals_shared_across_clones() {
        let globals = Globals::new();
        let other = globals.clone();
        globals.set("x", Value::Long(1));
        assert_eq!(other.get("x"), Some(Value::Long(1)));
    }
}
