//! Per-thread interception hook
//!
//! Each thread has one callback slot. While a callback is installed, every
//! eligible call on that thread is offered to it before execution; the
//! callback decides whether to specialize, pass, or permanently skip the
//! code. The slot is emptied for the duration of the callback's own
//! invocation, so code the callback runs is never re-intercepted on the
//! same thread.
//!
//! Installations scope strictly LIFO per thread: dropping a [`HookHandle`]
//! reinstates whatever was active before the matching install, on every
//! exit path including panics.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::frame::Frame;
use crate::guards::GuardedArtifact;

/// What the callback decided for one intercepted frame
#[derive(Debug)]
pub enum HookDecision {
    /// Record this specialization; the current call runs it if its guards
    /// pass against the intercepted frame
    Specialize(GuardedArtifact),
    /// Run the original body this time; the callback will be consulted
    /// again on the next call
    Pass,
    /// Permanently opt this code out of interception
    Skip,
}

/// The interception callback
///
/// Receives the intercepted frame and the number of specializations
/// already cached for its code. Panics propagate to the intercepted call.
pub type HookCallback = Arc<dyn Fn(&Frame, usize) -> HookDecision + Send + Sync>;

/// A callback is already installed on this thread
///
/// Returned by [`HookController::install`]; nesting must be declared
/// through [`HookController::install_nested`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReentrantHookError;

impl fmt::Display for ReentrantHookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a hook callback is already installed on this thread")
    }
}

impl std::error::Error for ReentrantHookError {}

thread_local! {
    static SLOT: RefCell<Option<HookCallback>> = const { RefCell::new(None) };
}

/// Installs, removes, and queries this thread's callback slot
pub struct HookController;

impl HookController {
    /// Install a callback on an empty slot
    ///
    /// Fails if a callback is already active; use
    /// [`install_nested`](Self::install_nested) to shadow one deliberately.
    pub fn install(callback: HookCallback) -> Result<HookHandle, ReentrantHookError> {
        SLOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(ReentrantHookError);
            }
            debug!(target: "dynatron::hook", "hook installed");
            let installed_at = Arc::as_ptr(&callback) as *const ();
            *slot = Some(callback);
            Ok(HookHandle { previous: None, installed_at, _not_send: PhantomData })
        })
    }

    /// Install a callback, shadowing any active one for this handle's
    /// lifetime
    pub fn install_nested(callback: HookCallback) -> HookHandle {
        debug!(target: "dynatron::hook", "hook installed (nested)");
        let installed_at = Arc::as_ptr(&callback) as *const ();
        let previous = SLOT.with(|slot| slot.borrow_mut().replace(callback));
        HookHandle { previous, installed_at, _not_send: PhantomData }
    }

    /// Install a callback around `f`, restoring the previous state on the
    /// way out
    pub fn scoped<R>(callback: HookCallback, f: impl FnOnce() -> R) -> R {
        let _handle = Self::install_nested(callback);
        f()
    }

    /// Check whether a callback is currently installed on this thread
    pub fn installed() -> bool {
        SLOT.with(|slot| slot.borrow().is_some())
    }

    /// Run `f` with the slot's callback, slot emptied for the duration
    ///
    /// Returns `None` without calling `f` when no callback is installed.
    /// The callback is restored even if `f` unwinds.
    pub(crate) fn with_active_suspended<R>(f: impl FnOnce(&HookCallback) -> R) -> Option<R> {
        let callback = SLOT.with(|slot| slot.borrow_mut().take())?;

        struct Restore(Option<HookCallback>);
        impl Drop for Restore {
            fn drop(&mut self) {
                if let Some(callback) = self.0.take() {
                    SLOT.with(|slot| *slot.borrow_mut() = Some(callback));
                }
            }
        }

        let restore = Restore(Some(callback.clone()));
        let result = f(&callback);
        drop(restore);
        Some(result)
    }
}

/// RAII token for one hook installation
///
/// Dropping reinstates whatever was active before the matching install.
/// Handles must drop in LIFO order; an out-of-order drop discards anything
/// installed above this handle and logs a warning.
pub struct HookHandle {
    previous: Option<HookCallback>,
    installed_at: *const (),
    _not_send: PhantomData<*const ()>,
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        SLOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            let current = slot
                .as_ref()
                .map(|cb| Arc::as_ptr(cb) as *const ());
            if current != Some(self.installed_at) {
                warn!(
                    target: "dynatron::hook",
                    "hook handle dropped out of LIFO order; unwinding to its install point"
                );
            }
            *slot = self.previous.take();
        });
        debug!(target: "dynatron::hook", "hook restored");
    }
}
