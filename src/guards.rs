//! Guards: validity predicates attached to specialized code
//!
//! A specialized body is only correct for the conditions observed when it
//! was produced. Each artifact carries an ordered conjunction of guards and
//! is eligible for a frame only when every guard passes against that
//! frame's [`FrameView`]. Evaluation short-circuits at the first failure,
//! in declaration order, so cheap guards should be declared first.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::bytecode::CodeBody;
use crate::frame::FrameView;
use crate::value::{Value, ValueKind};

type CustomPredicate = Arc<dyn Fn(&FrameView<'_>) -> bool + Send + Sync>;

/// One validity predicate over an intercepted frame
#[derive(Clone)]
pub enum Guard {
    /// Callee's declared arity equals the recorded value
    ArityEquals(u8),
    /// Local slot holds a value of the recorded kind; unbound slots fail
    LocalKind { slot: u32, kind: ValueKind },
    /// Global binding still equals the value snapshotted at specialization
    /// time; an unbound global fails
    GlobalStable { name: Arc<str>, snapshot: Value },
    /// Arbitrary read-only predicate
    ///
    /// The label names the predicate in logs. A panicking predicate is a
    /// caller bug and propagates.
    Custom { label: &'static str, pred: CustomPredicate },
}

impl Guard {
    /// Guard on a local slot's value kind
    pub fn local_kind(slot: u32, kind: ValueKind) -> Self {
        Self::LocalKind { slot, kind }
    }

    /// Guard on a global keeping its snapshotted value
    pub fn global_stable(name: impl Into<Arc<str>>, snapshot: Value) -> Self {
        Self::GlobalStable { name: name.into(), snapshot }
    }

    /// Guard on an arbitrary read-only predicate
    pub fn custom<F>(label: &'static str, pred: F) -> Self
    where
        F: Fn(&FrameView<'_>) -> bool + Send + Sync + 'static,
    {
        Self::Custom { label, pred: Arc::new(pred) }
    }

    /// Evaluate this guard against a frame
    pub fn evaluate(&self, view: &FrameView<'_>) -> bool {
        match self {
            Self::ArityEquals(n) => view.arity() == *n,
            Self::LocalKind { slot, kind } => view
                .local(*slot as usize)
                .is_some_and(|v| v.kind() == *kind),
            Self::GlobalStable { name, snapshot } => {
                view.global(name).as_ref() == Some(snapshot)
            }
            Self::Custom { pred, .. } => pred(view),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArityEquals(n) => write!(f, "ArityEquals({})", n),
            Self::LocalKind { slot, kind } => {
                write!(f, "LocalKind(slot={}, kind={:?})", slot, kind)
            }
            Self::GlobalStable { name, snapshot } => {
                write!(f, "GlobalStable({}, {})", name, snapshot)
            }
            Self::Custom { label, .. } => write!(f, "Custom({})", label),
        }
    }
}

/// A specialized code body together with the guards that justify it
#[derive(Debug, Clone)]
pub struct GuardedArtifact {
    guards: SmallVec<[Guard; 4]>,
    code: Arc<CodeBody>,
}

impl GuardedArtifact {
    pub fn new(guards: impl IntoIterator<Item = Guard>, code: Arc<CodeBody>) -> Self {
        Self { guards: guards.into_iter().collect(), code }
    }

    /// The specialized body
    pub fn code(&self) -> &Arc<CodeBody> {
        &self.code
    }

    /// The guard conjunction, in declaration order
    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// Check every guard against a frame, short-circuiting on failure
    pub fn matches(&self, view: &FrameView<'_>) -> bool {
        evaluate_all(&self.guards, view)
    }
}

/// Evaluate a guard conjunction in declaration order, short-circuiting on
/// the first failure
///
/// Side-effect-free with respect to the frame; evaluating twice against an
/// unchanged frame gives the same answer.
pub fn evaluate_all(guards: &[Guard], view: &FrameView<'_>) -> bool {
    for guard in guards {
        if !guard.evaluate(view) {
            trace!(target: "dynatron::guards", guard = ?guard, "guard failed");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, CompactEncoding, Opcode};
    use crate::frame::{Frame, Globals};

    fn frame_with(args: &[Value], globals: Globals) -> Frame {
        let mut builder = CodeBuilder::new("g", "<test>");
        builder.set_arity(args.len() as u8);
        for i in 0..args.len() {
            builder.add_local(format!("p{}", i));
        }
        builder.emit(Opcode::PushNil);
        builder.emit(Opcode::Return);
        Frame::for_call(builder.build(&CompactEncoding).unwrap(), args, globals)
    }

    fn nil_body() -> Arc<CodeBody> {
        let mut builder = CodeBuilder::new("nil", "<test>");
        builder.emit(Opcode::PushNil);
        builder.emit(Opcode::Return);
        builder.build(&CompactEncoding).unwrap()
    }

    #[test]
    fn test_arity_guard() {
        let frame = frame_with(&[Value::Long(1), Value::Long(2)], Globals::new());
        assert!(Guard::ArityEquals(2).evaluate(&frame.view()));
        assert!(!Guard::ArityEquals(3).evaluate(&frame.view()));
    }

    #[test]
    fn test_local_kind_guard_fails_on_unbound() {
        let frame = frame_with(&[Value::Long(1)], Globals::new());
        assert!(Guard::local_kind(0, ValueKind::Long).evaluate(&frame.view()));
        assert!(!Guard::local_kind(0, ValueKind::Bool).evaluate(&frame.view()));
        // Out-of-range slot reads as unbound
        assert!(!Guard::local_kind(7, ValueKind::Long).evaluate(&frame.view()));
    }

    #[test]
    fn test_global_stable_guard() {
        let globals = Globals::new();
        globals.set("mode", Value::str("fast"));
        let frame = frame_with(&[], globals.clone());

        let guard = Guard::global_stable("mode", Value::str("fast"));
        assert!(guard.evaluate(&frame.view()));

        globals.set("mode", Value::str("slow"));
        assert!(!guard.evaluate(&frame.view()));
    }

    #[test]
    fn test_global_stable_fails_when_unbound() {
        let frame = frame_with(&[], Globals::new());
        let guard = Guard::global_stable("mode", Value::Nil);
        assert!(!guard.evaluate(&frame.view()));
    }

    #[test]
    fn test_conjunction_short_circuits_in_order() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static REACHED: AtomicBool = AtomicBool::new(false);

        let frame = frame_with(&[Value::Long(1)], Globals::new());
        let artifact = GuardedArtifact::new(
            [
                Guard::ArityEquals(9),
                Guard::custom("never-reached", |_| {
                    REACHED.store(true, Ordering::SeqCst);
                    true
                }),
            ],
            nil_body(),
        );
        assert!(!artifact.matches(&frame.view()));
        assert!(!REACHED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_evaluate_all_is_repeatable() {
        let globals = Globals::new();
        globals.set("limit", Value::Long(3));
        let frame = frame_with(&[Value::Long(1)], globals);
        let guards = [
            Guard::ArityEquals(1),
            Guard::local_kind(0, ValueKind::Long),
            Guard::global_stable("limit", Value::Long(3)),
        ];
        let first = evaluate_all(&guards, &frame.view());
        let second = evaluate_all(&guards, &frame.view());
        assert!(first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_custom_guard_sees_frame_state() {
        let frame = frame_with(&[Value::Long(41)], Globals::new());
        let guard = Guard::custom("first-arg-positive", |view| {
            matches!(view.local(0), Some(Value::Long(n)) if *n > 0)
        });
        assert!(guard.evaluate(&frame.view()));
    }
}
