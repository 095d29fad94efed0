//! Per-strand invocation state: a trace plus the pending set.
//!
//! A [`Context`] combines the operation [`Trace`](crate::trace::Trace) of the
//! in-flight attempt with the eventuals that attempt is blocked on. Each
//! strand owns one context, reused across invocations; the replay driver
//! resets it at the start of every `run`.
//!
//! The context lives behind an `Arc<Mutex<_>>` because the completion handler
//! that restarts the attempt loop may fire on a different strand. Only one
//! strand drives a context at any moment (the originating strand has returned
//! to its caller before a handler can fire), so the lock is uncontended; it
//! exists to make the hand-off sound.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Error;
use crate::eventual::PendingHandle;
use crate::site::CallSite;
use crate::trace::{Memo, Trace};
use crate::tracing_compat::trace;

/// Shared handle to a strand's context.
pub(crate) type ContextHandle = Arc<Mutex<Context>>;

/// Locks a context handle, recovering from poisoning.
///
/// The state behind the lock is kept consistent by writing complete
/// transitions, so a panic on another strand does not invalidate it.
pub(crate) fn lock(handle: &ContextHandle) -> MutexGuard<'_, Context> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-invocation replay state.
#[derive(Debug)]
pub(crate) struct Context {
    trace: Trace,
    // Eventuals the current attempt is blocked on, in registration order.
    pending: Vec<Arc<dyn PendingHandle>>,
}

impl std::fmt::Debug for dyn PendingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PendingHandle")
    }
}

impl Context {
    pub(crate) const fn new() -> Self {
        Self {
            trace: Trace::new(),
            pending: Vec::new(),
        }
    }

    /// Creates a fresh context behind a shareable handle.
    pub(crate) fn handle() -> ContextHandle {
        trace!("creating replay context");
        Arc::new(Mutex::new(Self::new()))
    }

    /// Resets to the initial state, discarding all records and pending waits.
    pub(crate) fn reset(&mut self) {
        self.trace.reset();
        self.pending.clear();
    }

    /// Records that an operation executed at the caller's site and returns
    /// the record index together with a snapshot of its memo.
    #[track_caller]
    pub(crate) fn record(&mut self) -> Result<(usize, Memo), Error> {
        let site = CallSite::capture();
        let index = self.trace.record(site)?;
        Ok((index, self.trace.memo(index)))
    }

    pub(crate) fn store_future(&mut self, index: usize, handle: Arc<dyn Any + Send + Sync>) {
        self.trace.store_future(index, handle);
    }

    pub(crate) fn memoise_value(&mut self, index: usize, value: Arc<dyn Any + Send + Sync>) {
        self.trace.memoise_value(index, value);
    }

    pub(crate) fn memoise_done(&mut self, index: usize) {
        self.trace.memoise_done(index);
    }

    pub(crate) fn clear_memo(&mut self, index: usize) {
        self.trace.clear_memo(index);
    }

    /// Registers an eventual the current attempt is blocked on.
    pub(crate) fn push_pending(&mut self, handle: Arc<dyn PendingHandle>) {
        trace!("attempt blocked on an eventual");
        self.pending.push(handle);
    }

    /// Takes every blocked-on eventual. After this call the pending set is
    /// empty again.
    pub(crate) fn drain_pending(&mut self) -> Vec<Arc<dyn PendingHandle>> {
        std::mem::take(&mut self.pending)
    }

    /// Marks the attempt committed.
    pub(crate) fn commit(&mut self) -> Result<(), Error> {
        self.trace.commit()
    }

    /// Rolls the trace back for the next attempt.
    pub(crate) fn rollback(&mut self) -> Result<(), Error> {
        self.trace.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::eventual;

    fn f(context: &mut Context) -> Result<usize, Error> {
        context.record().map(|(index, _)| index)
    }

    fn g(context: &mut Context) -> Result<usize, Error> {
        context.record().map(|(index, _)| index)
    }

    #[test]
    fn noop() {
        let mut context = Context::new();
        context.commit().expect("commit failed");
    }

    #[test]
    fn use_after_commit() {
        let mut context = Context::new();
        context.commit().expect("commit failed");
        let err = context.record().expect_err("record succeeded");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn single_op() {
        let mut context = Context::new();
        f(&mut context).expect("record failed");
        context.commit().expect("commit failed");
    }

    #[test]
    fn single_op_retried() {
        let mut context = Context::new();
        let first = f(&mut context).expect("record failed");
        context.rollback().expect("rollback failed");
        let second = f(&mut context).expect("record failed");
        context.commit().expect("commit failed");
        assert_eq!(first, second);
    }

    #[test]
    fn single_op_retried_different_path() {
        let mut context = Context::new();
        f(&mut context).expect("record failed");
        g(&mut context).expect("record failed");
        f(&mut context).expect("record failed");
        context.rollback().expect("rollback failed");
        let err = g(&mut context).expect_err("divergence not detected");
        assert_eq!(err.kind(), ErrorKind::Determinism);
    }

    #[test]
    fn single_op_retried_terminated_early() {
        let mut context = Context::new();
        f(&mut context).expect("record failed");
        g(&mut context).expect("record failed");
        context.rollback().expect("rollback failed");
        let err = context.commit().expect_err("early return not detected");
        assert_eq!(err.kind(), ErrorKind::Determinism);
    }

    #[test]
    fn pending_set_drains_exactly_once() {
        let mut context = Context::new();
        let (_promise, pending) = eventual::pair::<i32>();
        context.push_pending(Arc::new(pending));
        let drained = context.drain_pending();
        assert_eq!(drained.len(), 1);
        assert!(context.drain_pending().is_empty());
    }

    #[test]
    fn reset_clears_pending() {
        let mut context = Context::new();
        let (_promise, pending) = eventual::pair::<i32>();
        context.push_pending(Arc::new(pending));
        context.reset();
        assert!(context.drain_pending().is_empty());
    }
}
