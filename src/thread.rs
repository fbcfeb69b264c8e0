//! Per-thread context lifecycle.
//!
//! Each application thread owns exactly one [`ThreadContext`], installed in
//! a thread-local slot when the engine reports the thread starting and torn
//! down when it exits. Only the owning thread ever touches it, so no
//! synchronization is involved.

use core::cell::RefCell;
use std::thread::ThreadId;

use crate::shadow_rt::ShadowCallStack;

/// State owned by one application thread: its shadow call stack.
#[derive(Debug)]
pub struct ThreadContext {
    thread_id: ThreadId,
    shadow_stack: ShadowCallStack,
}

impl ThreadContext {
    /// Create a context for the calling thread
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_id: std::thread::current().id(),
            shadow_stack: ShadowCallStack::new(),
        }
    }

    /// Id of the owning thread
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// The thread's shadow call stack
    #[must_use]
    pub fn shadow_stack(&self) -> &ShadowCallStack {
        &self.shadow_stack
    }

    /// The thread's shadow call stack, mutably
    pub fn shadow_stack_mut(&mut self) -> &mut ShadowCallStack {
        &mut self.shadow_stack
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

/// Install a fresh [`ThreadContext`] for the calling thread. Returns
/// `false` if one was already installed.
pub fn register_current_thread() -> bool {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.is_some() {
            return false;
        }
        *current = Some(ThreadContext::new());
        true
    })
}

/// Tear down the calling thread's context, handing it back to the caller.
pub fn unregister_current_thread() -> Option<ThreadContext> {
    CURRENT.with(|current| current.borrow_mut().take())
}

/// Run `f` on the calling thread's context, if one is installed.
pub fn with_current<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow_mut().as_mut().map(f))
}

/// Run `f` on the calling thread's context, installing one first if the
/// engine never reported this thread (the main thread commonly predates
/// instrumentation).
pub fn with_current_or_register<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> R {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let context = current.get_or_insert_with(|| {
            log::debug!("implicitly registering unreported thread");
            ThreadContext::new()
        });
        f(context)
    })
}

#[cfg(test)]
mod tests {
    use super::{
        register_current_thread, unregister_current_thread, with_current,
        with_current_or_register,
    };
    use crate::shadow_rt::CallRecord;

    #[test]
    fn test_register_unregister() {
        assert!(register_current_thread());
        assert!(!register_current_thread());

        assert!(unregister_current_thread().is_some());
        assert!(unregister_current_thread().is_none());
    }

    #[test]
    fn test_context_survives_between_events() {
        register_current_thread();
        with_current(|ctx| {
            ctx.shadow_stack_mut().push(CallRecord {
                call_site: 0x10,
                expected_sp: 0x100,
                expected_return_address: 0x15,
            });
        });

        let depth = with_current(|ctx| ctx.shadow_stack().depth());
        assert_eq!(depth, Some(1));

        let context = unregister_current_thread().unwrap();
        assert_eq!(context.shadow_stack().depth(), 1);
    }

    #[test]
    fn test_implicit_registration() {
        assert!(unregister_current_thread().is_none());
        let depth = with_current_or_register(|ctx| ctx.shadow_stack().depth());
        assert_eq!(depth, 0);
        assert!(unregister_current_thread().is_some());
    }
}
