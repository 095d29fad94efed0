//! Eventual values: the future primitive the replay runtime consumes.
//!
//! An [`Eventual`] is a shared handle to a value that will be produced later
//! by its [`Promise`]. It has exactly the shape the replay driver needs:
//!
//! - a non-blocking readiness probe ([`Eventual::is_resolved`])
//! - extraction once resolved ([`Eventual::try_result`])
//! - completion callbacks ([`Eventual::subscribe`]), cancellable per
//!   subscription
//! - advisory cancellation ([`Eventual::request_cancel`])
//!
//! It also integrates with the rest of the ecosystem: blocking waits for
//! synchronous callers, and a [`std::future::Future`] impl so resolved values
//! compose with ordinary async code.
//!
//! # Broken promises
//!
//! Dropping a [`Promise`] without resolving it fails the eventual with
//! [`ErrorKind::BrokenPromise`](crate::ErrorKind::BrokenPromise), so nothing
//! ever waits forever on a value whose producer has gone away.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{BrokenPromise, Error};
use crate::tracing_compat::trace;

/// Creates a connected promise/eventual pair.
#[must_use]
pub fn pair<T>() -> (Promise<T>, Eventual<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(PendingState::new())),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
            fulfilled: false,
        },
        Eventual { shared },
    )
}

/// The consuming side of an eventual value.
///
/// Not cloneable: each eventual has exactly one producer, so the value is
/// written at most once by construction.
#[derive(Debug)]
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    fulfilled: bool,
}

/// A shared handle to a value that resolves later.
#[derive(Debug)]
pub struct Eventual<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Eventual<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.state.try_lock() {
            Ok(state) => match &*state {
                State::Pending(_) => "pending",
                State::Resolved(Ok(_)) => "resolved",
                State::Resolved(Err(_)) => "failed",
            },
            Err(_) => "locked",
        };
        f.debug_struct("Shared").field("state", &label).finish()
    }
}

enum State<T> {
    Pending(PendingState),
    Resolved(Result<T, Error>),
}

struct PendingState {
    callbacks: Vec<Callback>,
    wakers: Vec<Waker>,
    next_subscription: u64,
    cancel_requested: bool,
}

impl PendingState {
    const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            wakers: Vec::new(),
            next_subscription: 0,
            cancel_requested: false,
        }
    }
}

struct Callback {
    id: u64,
    run: Box<dyn FnOnce() + Send>,
}

fn lock_state<T>(shared: &Shared<T>) -> std::sync::MutexGuard<'_, State<T>> {
    match shared.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Erasure point for subscription cancellation, so a [`Subscription`] does not
/// carry the eventual's value type.
trait Subscribers: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

impl<T: Send + 'static> Subscribers for Shared<T> {
    fn unsubscribe(&self, id: u64) {
        if let State::Pending(pending) = &mut *lock_state(self) {
            pending.callbacks.retain(|cb| cb.id != id);
        }
    }
}

/// A registered completion callback.
///
/// Cancelling deregisters the callback if it has not fired; cancellation is
/// advisory and racing a concurrent resolution is allowed to lose.
#[derive(Clone)]
pub struct Subscription {
    target: Weak<dyn Subscribers>,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Deregisters the callback if it is still pending.
    pub fn cancel(&self) {
        if let Some(target) = self.target.upgrade() {
            target.unsubscribe(self.id);
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Resolves the eventual with a value.
    pub fn resolve(mut self, value: T) {
        self.fulfil(Ok(value));
    }

    /// Fails the eventual with an error.
    pub fn fail(mut self, error: Error) {
        self.fulfil(Err(error));
    }

    /// Returns true if the consuming side requested advisory cancellation.
    ///
    /// A promise may observe this and stop producing; honouring it is
    /// optional and resolving afterwards is still valid.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        match &*lock_state(&self.shared) {
            State::Pending(pending) => pending.cancel_requested,
            State::Resolved(_) => false,
        }
    }

    fn fulfil(&mut self, result: Result<T, Error>) {
        self.fulfilled = true;
        let (callbacks, wakers) = {
            let mut state = lock_state(&self.shared);
            match &mut *state {
                State::Pending(pending) => {
                    let callbacks = std::mem::take(&mut pending.callbacks);
                    let wakers = std::mem::take(&mut pending.wakers);
                    *state = State::Resolved(result);
                    (callbacks, wakers)
                }
                State::Resolved(_) => return,
            }
        };
        self.shared.ready.notify_all();
        trace!(
            callbacks = callbacks.len(),
            wakers = wakers.len(),
            "eventual resolved"
        );
        for callback in callbacks {
            (callback.run)();
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        let (callbacks, wakers) = {
            let mut state = lock_state(&self.shared);
            match &mut *state {
                State::Pending(pending) => {
                    let callbacks = std::mem::take(&mut pending.callbacks);
                    let wakers = std::mem::take(&mut pending.wakers);
                    *state = State::Resolved(Err(BrokenPromise.into()));
                    (callbacks, wakers)
                }
                State::Resolved(_) => return,
            }
        };
        self.shared.ready.notify_all();
        for callback in callbacks {
            (callback.run)();
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Eventual<T> {
    /// Returns true once a value or error is available.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(&*lock_state(&self.shared), State::Resolved(_))
    }

    /// Requests advisory cancellation.
    ///
    /// Sets a flag the promise side may observe; it does not resolve the
    /// eventual and does not guarantee the producer stops.
    pub fn request_cancel(&self) {
        if let State::Pending(pending) = &mut *lock_state(&self.shared) {
            pending.cancel_requested = true;
        }
    }
}

impl<T: Send + 'static> Eventual<T> {
    /// An eventual that is already resolved with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Resolved(Ok(value))),
                ready: Condvar::new(),
            }),
        }
    }

    /// An eventual that has already failed with `error`.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Resolved(Err(error))),
                ready: Condvar::new(),
            }),
        }
    }

    /// Registers a completion callback.
    ///
    /// If the eventual is already resolved the callback runs immediately on
    /// the calling thread; otherwise it runs on the thread that resolves the
    /// promise. The returned [`Subscription`] deregisters it.
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) -> Subscription {
        let mut state = lock_state(&self.shared);
        match &mut *state {
            State::Pending(pending) => {
                let id = pending.next_subscription;
                pending.next_subscription += 1;
                pending.callbacks.push(Callback {
                    id,
                    run: Box::new(callback),
                });
                drop(state);
                let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
                let target: Weak<dyn Subscribers> = weak;
                Subscription { target, id }
            }
            State::Resolved(_) => {
                drop(state);
                callback();
                let target: Weak<dyn Subscribers> = Weak::<Shared<T>>::new();
                Subscription { target, id: 0 }
            }
        }
    }
}

impl<T: Clone> Eventual<T> {
    /// Extracts the result if resolved, without blocking.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T, Error>> {
        match &*lock_state(&self.shared) {
            State::Pending(_) => None,
            State::Resolved(result) => Some(result.clone()),
        }
    }

    /// Blocks the calling thread until the eventual resolves.
    pub fn wait(&self) -> Result<T, Error> {
        let mut state = lock_state(&self.shared);
        loop {
            match &*state {
                State::Resolved(result) => return result.clone(),
                State::Pending(_) => {
                    state = match self.shared.ready.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    /// Blocks until the eventual resolves or the timeout elapses.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock_state(&self.shared);
        loop {
            if let State::Resolved(result) = &*state {
                return Some(result.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            state = match self.shared.ready.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl<T: Clone> Future for Eventual<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock_state(&self.shared);
        match &mut *state {
            State::Resolved(result) => Poll::Ready(result.clone()),
            State::Pending(pending) => {
                if !pending.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    pending.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// Internal view of a pending eventual: just enough shape for the replay
/// driver to race completions without knowing the value type.
pub(crate) trait PendingHandle: Send + Sync {
    /// Registers a type-erased completion callback.
    fn subscribe_erased(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription;
}

impl<T: Send + Sync + 'static> PendingHandle for Eventual<T> {
    fn subscribe_erased(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
        self.subscribe(callback)
    }
}

/// Creates an eventual resolved on another thread after `delay`.
///
/// Primarily a test aid; mirrors deferring work to an executor.
#[must_use]
pub fn resolve_after<T: Send + 'static>(value: T, delay: Duration) -> Eventual<T> {
    let (promise, eventual) = pair();
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        promise.resolve(value);
    });
    eventual
}
