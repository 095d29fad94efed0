//! The per-strand context slot and scoped binding.
//!
//! Two thread-local slots cooperate here:
//!
//! - the *strand* slot holds the thread's persistent [`Context`], created
//!   lazily and reused across invocations so `run` amortises allocation;
//! - the *binding* slot names the context the currently executing attempt
//!   runs against. It is installed by the replay driver for exactly the
//!   duration of an attempt, via an RAII guard that saves and restores the
//!   previous binding, so completion handlers can re-enter a context from a
//!   worker thread without leaking the binding.
//!
//! Operation primitives read only the binding slot; using one while it is
//! empty is an error ([`ErrorKind::NoContext`](crate::ErrorKind::NoContext)).

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::context::{Context, ContextHandle};
use crate::tracing_compat::trace;

thread_local! {
    static STRAND: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
    static BOUND: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

/// The calling thread's persistent context, created on first use.
pub(crate) fn strand_context() -> ContextHandle {
    STRAND.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(Context::handle)
            .clone()
    })
}

/// The context the current attempt executes against, if any.
pub(crate) fn bound() -> Option<ContextHandle> {
    BOUND.with(|slot| slot.borrow().clone())
}

/// True while an attempt is executing on this thread.
pub(crate) fn is_bound() -> bool {
    BOUND.with(|slot| slot.borrow().is_some())
}

/// Installs `context` as the bound context until the guard drops.
#[must_use]
pub(crate) fn bind(context: ContextHandle) -> BindGuard {
    let previous = BOUND.with(|slot| slot.borrow_mut().replace(context));
    trace!("bound replay context");
    BindGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previously bound context on drop.
pub(crate) struct BindGuard {
    previous: Option<ContextHandle>,
    // The guard manipulates thread-local state; keep it on the thread that
    // created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BOUND.with(|slot| *slot.borrow_mut() = previous);
        trace!("restored previous replay binding");
    }
}
