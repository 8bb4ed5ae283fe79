//! End-to-end interception: hook install, rewrite, guarded cache dispatch,
//! skip gate, and fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::smallvec;

use dynatron::bytecode::{CodeBody, CodeBuilder, CompactEncoding, Opcode};
use dynatron::eval::Evaluator;
use dynatron::guards::{Guard, GuardedArtifact};
use dynatron::hook::{HookController, HookDecision};
use dynatron::skipfiles::SkipSet;
use dynatron::transform::TransformPipeline;
use dynatron::value::{Value, ValueKind};
use dynatron::SpecializationCache;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// fn add(a, b) { return a + b }
fn add_body(source: &str) -> Arc<CodeBody> {
    let mut b = CodeBuilder::new("add", source);
    b.set_arity(2);
    b.add_local("a");
    b.add_local("b");
    b.emit_arg(Opcode::LoadLocal, 0);
    b.emit_arg(Opcode::LoadLocal, 1);
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    b.build(&CompactEncoding).expect("add body links")
}

fn isolated_evaluator() -> Evaluator {
    Evaluator::new()
        .with_cache(Arc::new(SpecializationCache::new()))
        .with_skip_set(Arc::new(SkipSet::new()))
}

/// Rewrites `a + b` into `a * b + a + b` and counts invocations.
fn strengthening_pipeline(counter: Arc<AtomicUsize>) -> TransformPipeline {
    TransformPipeline::new(Arc::new(move |stream, _view| {
        counter.fetch_add(1, Ordering::SeqCst);
        stream.insert(1, Opcode::Add, None);
        stream.insert(0, Opcode::Mul, None);
        stream.insert(0, Opcode::LoadLocal, Some(1));
        stream.insert(0, Opcode::LoadLocal, Some(0));
        Ok(smallvec![
            Guard::local_kind(0, ValueKind::Long),
            Guard::local_kind(1, ValueKind::Long),
        ])
    }))
}

#[test]
fn test_rewrite_changes_result_and_caches() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));

    let rewrites = Arc::new(AtomicUsize::new(0));
    let pipeline = strengthening_pipeline(rewrites.clone());
    let _hook = HookController::install(pipeline.into_hook(eval.cache().clone())).expect("hook slot empty");

    // a*b + a + b for (5, 6)
    assert_eq!(
        eval.call("add", &[Value::Long(5), Value::Long(6)]),
        Ok(Value::Long(41))
    );
    assert_eq!(rewrites.load(Ordering::SeqCst), 1);

    // Second call is a cache hit; the rewrite does not run again
    assert_eq!(
        eval.call("add", &[Value::Long(2), Value::Long(3)]),
        Ok(Value::Long(11))
    );
    assert_eq!(rewrites.load(Ordering::SeqCst), 1);
}

#[test]
fn test_skip_gate_never_consults_callback() {
    init_logging();
    let skip = Arc::new(SkipSet::with_prefixes(["vendor/"]));
    let eval = Evaluator::new()
        .with_cache(Arc::new(SpecializationCache::new()))
        .with_skip_set(skip);
    eval.define("add", add_body("vendor/runtime.rs"));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let _hook = HookController::install(Arc::new(move |_frame, _size| {
        counter.fetch_add(1, Ordering::SeqCst);
        HookDecision::Pass
    })).expect("hook slot empty");

    assert_eq!(
        eval.call("add", &[Value::Long(5), Value::Long(6)]),
        Ok(Value::Long(11))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_fallback_without_hook() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));
    assert_eq!(
        eval.call("add", &[Value::Long(3), Value::Long(4)]),
        Ok(Value::Long(7))
    );
}

#[test]
fn test_failed_guards_fall_back_to_original() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));

    let rewrites = Arc::new(AtomicUsize::new(0));
    let pipeline = strengthening_pipeline(rewrites.clone());
    let _hook = HookController::install(pipeline.into_hook(eval.cache().clone())).expect("hook slot empty");

    // Specialize on Longs first
    assert_eq!(
        eval.call("add", &[Value::Long(5), Value::Long(6)]),
        Ok(Value::Long(41))
    );

    // Bool arguments fail the Long guards; the callback runs again and its
    // fresh artifact also fails for this frame, so the original executes.
    // Bool + Bool is a runtime type error in the original semantics.
    let result = eval.call("add", &[Value::Bool(true), Value::Bool(false)]);
    assert!(result.is_err());
    assert_eq!(rewrites.load(Ordering::SeqCst), 2);
}

#[test]
fn test_global_guard_dispatches_between_versions() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));
    eval.globals().set("mode", Value::str("fast"));

    // Specialize only while mode == "fast", guarded on the snapshot
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = eval.cache().clone();
    let _hook = HookController::install(Arc::new(move |frame, _size| {
        counter.fetch_add(1, Ordering::SeqCst);
        if frame.view().global("mode") != Some(Value::str("fast")) {
            return HookDecision::Pass;
        }
        let pipeline = strengthening_pipeline(Arc::new(AtomicUsize::new(0)));
        match pipeline.specialize(frame, &cache) {
            Ok(artifact) => {
                let guards: Vec<Guard> = std::iter::once(Guard::global_stable(
                    "mode",
                    Value::str("fast"),
                ))
                .chain(artifact.guards().iter().cloned())
                .collect();
                HookDecision::Specialize(GuardedArtifact::new(guards, artifact.code().clone()))
            }
            Err(_) => HookDecision::Pass,
        }
    })).expect("hook slot empty");

    assert_eq!(
        eval.call("add", &[Value::Long(5), Value::Long(6)]),
        Ok(Value::Long(41))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Flipping the global invalidates the artifact; original semantics run
    eval.globals().set("mode", Value::str("slow"));
    assert_eq!(
        eval.call("add", &[Value::Long(5), Value::Long(6)]),
        Ok(Value::Long(11))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Flipping back revives the cached artifact without a new callback
    eval.globals().set("mode", Value::str("fast"));
    assert_eq!(
        eval.call("add", &[Value::Long(5), Value::Long(6)]),
        Ok(Value::Long(41))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_callback_is_not_reentered() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));
    eval.define("helper", add_body("app/util.rs"));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let inner_eval = eval.clone();
    let _hook = HookController::install(Arc::new(move |_frame, _size| {
        counter.fetch_add(1, Ordering::SeqCst);
        // A call made while deciding must not be intercepted
        let nested = inner_eval.call("helper", &[Value::Long(1), Value::Long(2)]);
        assert_eq!(nested, Ok(Value::Long(3)));
        HookDecision::Pass
    })).expect("hook slot empty");

    assert_eq!(
        eval.call("add", &[Value::Long(3), Value::Long(4)]),
        Ok(Value::Long(7))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_skip_decision_is_sticky() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let _hook = HookController::install(Arc::new(move |_frame, _size| {
        counter.fetch_add(1, Ordering::SeqCst);
        HookDecision::Skip
    })).expect("hook slot empty");

    for _ in 0..3 {
        assert_eq!(
            eval.call("add", &[Value::Long(3), Value::Long(4)]),
            Ok(Value::Long(7))
        );
    }
    // Consulted exactly once; the sentinel short-circuits afterwards
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_callback_panic_propagates_and_hook_survives() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));

    let _hook = HookController::install(Arc::new(|_frame, _size| panic!("callback bug"))).expect("hook slot empty");
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        eval.call("add", &[Value::Long(1), Value::Long(2)])
    }));
    assert!(result.is_err());
    // The suspended callback was restored during unwinding
    assert!(HookController::installed());
}

#[test]
fn test_specialized_bodies_are_not_reintercepted() {
    init_logging();
    let eval = isolated_evaluator();
    eval.define("add", add_body("app/main.rs"));

    let rewrites = Arc::new(AtomicUsize::new(0));
    let pipeline = strengthening_pipeline(rewrites.clone());
    let _hook = HookController::install(pipeline.into_hook(eval.cache().clone())).expect("hook slot empty");

    // Ten calls, one rewrite: cached shadow bodies carry the internal
    // origin and never reach the callback themselves
    for _ in 0..10 {
        assert_eq!(
            eval.call("add", &[Value::Long(5), Value::Long(6)]),
            Ok(Value::Long(41))
        );
    }
    assert_eq!(rewrites.load(Ordering::SeqCst), 1);
}
