//! The replay driver: the attempt loop and wake-up orchestration.
//!
//! [`run`] executes a closure under deterministic replay. One pass through
//! the closure is an *attempt*; it either returns (the trace commits and the
//! result publishes), fails (the failure publishes), or suspends at an
//! unresolved await (the break signal unwinds to the loop via `?`).
//!
//! On suspension the driver drains the pending set, subscribes a one-shot
//! completion handler to every pending eventual, and returns. The first
//! handler to fire wins a CAS race, cancels its sibling subscriptions
//! (best-effort; cancellation is advisory), installs the owning context on
//! the firing strand, and re-enters the attempt loop. Racing the first
//! completion rather than waiting for all of them is deliberate: as soon as
//! any resolves, a previously blocking await can make progress, and a still
//! pending await on the next attempt simply re-subscribes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ambient;
use crate::context::{lock, ContextHandle};
use crate::error::{Error, ErrorKind, OpError, OpResult};
use crate::eventual::{pair, Eventual, PendingHandle, Promise, Subscription};
use crate::tracing_compat::{debug, trace};

type Closure<A> = dyn Fn() -> OpResult<A> + Send + Sync;

/// Runs `closure` under deterministic replay, producing an eventual result.
///
/// The first attempt executes synchronously on the calling thread; if it
/// suspends, later attempts execute on whichever thread resolves the awaited
/// eventual. The closure therefore re-runs from the top an unbounded number
/// of times: guard side-effects with [`once`](crate::once) /
/// [`once_unit`](crate::once_unit) and keep everything else pure.
///
/// The returned [`Eventual`] resolves with the closure's value, or fails
/// with the closure's first non-transient error, with a
/// [`DeterminismError`](crate::DeterminismError) if replay diverged, or with
/// [`ErrorKind::BrokenPromise`] if every pending await's producer went away.
pub fn run<A, F>(closure: F) -> Eventual<A>
where
    A: Send + 'static,
    F: Fn() -> OpResult<A> + Send + Sync + 'static,
{
    let (promise, result) = pair();
    if ambient::is_bound() {
        promise.fail(
            Error::new(ErrorKind::InvalidState)
                .with_context("run may not be nested inside another run closure"),
        );
        return result;
    }

    trace!("running new replay closure");
    let context = ambient::strand_context();
    lock(&context).reset();

    let closure: Arc<Closure<A>> = Arc::new(closure);
    try_complete(context, closure, promise);
    result
}

/// The attempt loop for one invocation.
///
/// Either publishes into `promise` before returning, or hands the promise to
/// the wake-up race when the attempt suspended on pending eventuals.
fn try_complete<A: Send + 'static>(
    context: ContextHandle,
    closure: Arc<Closure<A>>,
    promise: Promise<A>,
) {
    loop {
        trace!("entering attempt");
        let attempt = {
            let _bound = ambient::bind(context.clone());
            closure()
        };
        match attempt {
            Ok(value) => {
                match lock(&context).commit() {
                    Ok(()) => promise.resolve(value),
                    Err(error) => {
                        debug!(%error, "commit rejected the attempt");
                        promise.fail(error);
                    }
                }
                return;
            }
            // The sole catch site for the break signal. The signal's
            // constructor is crate-private, so this arm can only be reached
            // by a suspension or retry decision taken by an operation
            // primitive on this very context.
            Err(OpError::Break(_)) => {
                if let Err(error) = lock(&context).rollback() {
                    promise.fail(error);
                    return;
                }
                let pending = lock(&context).drain_pending();
                if pending.is_empty() {
                    // A retry-eligible failure suspended the attempt without
                    // blocking on anything: re-attempt immediately.
                    trace!("nothing pending, re-attempting");
                    continue;
                }
                trace!(count = pending.len(), "attempt blocked, racing completions");
                wait_for_any(context, closure, promise, pending);
                return;
            }
            Err(OpError::Fail(error)) => {
                debug!(%error, "attempt failed");
                promise.fail(error);
                return;
            }
        }
    }
}

/// Everything the winning completion handler needs to resume the invocation.
struct Resume<A> {
    context: ContextHandle,
    closure: Arc<Closure<A>>,
    promise: Promise<A>,
}

/// Shared state of one wait cycle's wake-up race.
struct WakeRace<A> {
    fired: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    resume: Mutex<Option<Resume<A>>>,
}

fn wait_for_any<A: Send + 'static>(
    context: ContextHandle,
    closure: Arc<Closure<A>>,
    promise: Promise<A>,
    pending: Vec<Arc<dyn PendingHandle>>,
) {
    let race = Arc::new(WakeRace {
        fired: AtomicBool::new(false),
        subscriptions: Mutex::new(Vec::with_capacity(pending.len())),
        resume: Mutex::new(Some(Resume {
            context,
            closure,
            promise,
        })),
    });

    for handle in pending {
        let entrant = Arc::clone(&race);
        // May fire synchronously if the eventual resolved since the attempt
        // observed it pending; the CAS below keeps re-entry single-shot.
        let subscription = handle.subscribe_erased(Box::new(move || wake(&entrant)));
        lock_subscriptions(&race).push(subscription);
    }
}

fn wake<A: Send + 'static>(race: &WakeRace<A>) {
    if race.fired.swap(true, Ordering::AcqRel) {
        return;
    }
    trace!("completion won the wake-up race");
    for subscription in lock_subscriptions(race).drain(..) {
        subscription.cancel();
    }
    let resume = match race.resume.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    let Some(resume) = resume else {
        return;
    };
    try_complete(resume.context, resume.closure, resume.promise);
}

fn lock_subscriptions<A>(race: &WakeRace<A>) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
    match race.subscriptions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
