//! The user-facing operation primitives.
//!
//! An [`Op`] translates each call site into a trace record and either replays
//! the memoised result or executes for real:
//!
//! - [`Op::await_value`] consumes an [`Eventual`], suspending the attempt
//!   when it is not yet resolved;
//! - [`Op::perform`] / [`Op::perform_unit`] fence a synchronous side-effect
//!   so it runs at most once across all attempts.
//!
//! The free functions [`await_value`], [`once`] and [`once_unit`] use an
//! unconfigured `Op` with an empty retry set. Build a configured one with
//! [`op_builder`] to treat selected error kinds as transient.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::ambient;
use crate::context::{lock, ContextHandle};
use crate::error::{BreakSignal, Error, ErrorKind, OpError, OpResult};
use crate::eventual::Eventual;
use crate::trace::Memo;
use crate::tracing_compat::trace;

/// A configured operation facade.
///
/// Cheap to clone; the retry set is shared.
#[derive(Clone)]
pub struct Op<T> {
    retry_on: Arc<[RetryPredicate]>,
    _result: PhantomData<fn() -> T>,
}

#[derive(Clone)]
struct RetryPredicate {
    describes: &'static str,
    matches: Arc<dyn Fn(&Error) -> bool + Send + Sync>,
}

impl<T> std::fmt::Debug for Op<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let predicates: Vec<_> = self.retry_on.iter().map(|p| p.describes).collect();
        f.debug_struct("Op").field("retry_on", &predicates).finish()
    }
}

/// Builder for an [`Op`] with a configured retry set.
pub struct OpBuilder<T> {
    predicates: Vec<RetryPredicate>,
    _result: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for OpBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let predicates: Vec<_> = self.predicates.iter().map(|p| p.describes).collect();
        f.debug_struct("OpBuilder")
            .field("retry_on", &predicates)
            .finish()
    }
}

impl<T> Default for OpBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OpBuilder<T> {
    /// Starts an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            predicates: Vec::new(),
            _result: PhantomData,
        }
    }

    /// Treats errors whose source is an `E` as transient: observing one
    /// aborts the attempt and re-executes the operation on the next attempt
    /// instead of failing the invocation.
    #[must_use]
    pub fn retry_on<E: std::error::Error + Send + Sync + 'static>(mut self) -> Self {
        self.predicates.push(RetryPredicate {
            describes: std::any::type_name::<E>(),
            matches: Arc::new(|error: &Error| {
                error.source_ref().is_some_and(|source| source.is::<E>())
            }),
        });
        self
    }

    /// Treats errors of the given kind as transient.
    #[must_use]
    pub fn retry_on_kind(mut self, kind: ErrorKind) -> Self {
        self.predicates.push(RetryPredicate {
            describes: kind_name(kind),
            matches: Arc::new(move |error: &Error| error.kind() == kind),
        });
        self
    }

    /// Finishes the builder.
    #[must_use]
    pub fn build(self) -> Op<T> {
        Op {
            retry_on: self.predicates.into(),
            _result: PhantomData,
        }
    }
}

const fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Determinism => "Determinism",
        ErrorKind::InvalidState => "InvalidState",
        ErrorKind::NoContext => "NoContext",
        ErrorKind::Cancelled => "Cancelled",
        ErrorKind::BrokenPromise => "BrokenPromise",
        ErrorKind::Internal => "Internal",
        ErrorKind::User => "User",
    }
}

impl<T> Default for Op<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Op<T> {
    /// An operation with an empty retry set.
    #[must_use]
    pub fn new() -> Self {
        OpBuilder::new().build()
    }

    /// Starts a builder for a configured operation.
    #[must_use]
    pub const fn builder() -> OpBuilder<T> {
        OpBuilder::new()
    }

    fn is_retryable(&self, error: &Error) -> bool {
        self.retry_on.iter().any(|p| (p.matches)(error))
    }

    /// Applies the retry-or-propagate policy to an observed failure.
    fn handle_failure(&self, error: Error) -> OpError {
        if self.is_retryable(&error) {
            trace!("retry-eligible failure, suspending for re-attempt");
            OpError::Break(BreakSignal::new())
        } else {
            OpError::Fail(error)
        }
    }

    /// Fences a value-less side-effect: the closure runs during at most one
    /// attempt; later attempts skip it.
    #[track_caller]
    pub fn perform_unit<F>(&self, closure: F) -> OpResult<()>
    where
        F: FnOnce() -> Result<(), Error>,
    {
        let context = bound_context()?;
        let (index, memo) = lock(&context).record()?;
        match memo {
            Memo::Done => Ok(()),
            Memo::Unset => match closure() {
                Ok(()) => {
                    lock(&context).memoise_done(index);
                    Ok(())
                }
                Err(error) => Err(self.handle_failure(error)),
            },
            Memo::Future(_) | Memo::Value(_) => Err(changed_operation(index)),
        }
    }
}

impl<T> Op<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Awaits an eventual value.
    ///
    /// The first attempt to traverse this call site stores the given
    /// eventual; replays discard their (freshly created) argument in favour
    /// of the stored one. If the stored eventual is resolved, its value is
    /// memoised and returned; if it failed, the retry policy decides between
    /// suspension and propagating the error; otherwise the attempt suspends
    /// until the eventual resolves.
    #[track_caller]
    pub fn await_value(&self, eventual: Eventual<T>) -> OpResult<T> {
        let context = bound_context()?;
        let (index, memo) = lock(&context).record()?;
        let stored = match memo {
            Memo::Value(payload) => return Ok(downcast_value::<T>(&payload)?),
            Memo::Unset => {
                lock(&context).store_future(index, Arc::new(eventual.clone()));
                eventual
            }
            Memo::Future(handle) => downcast_eventual::<T>(&handle)?,
            Memo::Done => return Err(changed_operation(index)),
        };
        match stored.try_result() {
            Some(Ok(value)) => {
                lock(&context).memoise_value(index, Arc::new(value.clone()));
                Ok(value)
            }
            Some(Err(error)) => {
                if self.is_retryable(&error) {
                    // Re-execute: the next attempt stores the fresh eventual
                    // its replayed expression produces.
                    lock(&context).clear_memo(index);
                    trace!("retry-eligible await failure, suspending for re-attempt");
                    Err(OpError::Break(BreakSignal::new()))
                } else {
                    Err(OpError::Fail(error))
                }
            }
            None => {
                lock(&context).push_pending(Arc::new(stored));
                Err(OpError::Break(BreakSignal::new()))
            }
        }
    }

    /// Fences a side-effect that produces a value: the closure runs during at
    /// most one attempt; later attempts return the memoised value.
    #[track_caller]
    pub fn perform<F>(&self, closure: F) -> OpResult<T>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let context = bound_context()?;
        let (index, memo) = lock(&context).record()?;
        match memo {
            Memo::Value(payload) => Ok(downcast_value::<T>(&payload)?),
            Memo::Unset => match closure() {
                Ok(value) => {
                    lock(&context).memoise_value(index, Arc::new(value.clone()));
                    Ok(value)
                }
                Err(error) => Err(self.handle_failure(error)),
            },
            Memo::Future(_) | Memo::Done => Err(changed_operation(index)),
        }
    }
}

fn bound_context() -> Result<ContextHandle, Error> {
    ambient::bound().ok_or_else(Error::no_context)
}

// The record at this index was produced by a different primitive (or a
// different value type) than the one replaying it: same call site, different
// operation. Call-site identity cannot tell them apart, so surface it as a
// determinism violation.
fn changed_operation(index: usize) -> OpError {
    OpError::Fail(
        Error::new(ErrorKind::Determinism).with_context(format!(
            "operation {index} changed shape between attempts; \
             consider using tokamak::once() around the code that varies"
        )),
    )
}

fn downcast_value<T: Clone + Send + Sync + 'static>(
    payload: &Arc<dyn Any + Send + Sync>,
) -> Result<T, OpError> {
    payload
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| type_mismatch::<T>())
}

fn downcast_eventual<T: Clone + Send + Sync + 'static>(
    handle: &Arc<dyn Any + Send + Sync>,
) -> Result<Eventual<T>, OpError> {
    handle
        .downcast_ref::<Eventual<T>>()
        .cloned()
        .ok_or_else(|| type_mismatch::<T>())
}

fn type_mismatch<T>() -> OpError {
    OpError::Fail(Error::new(ErrorKind::Determinism).with_context(format!(
        "operation changed value type between attempts (now {}); \
         consider using tokamak::once() around the code that varies",
        std::any::type_name::<T>()
    )))
}

/// Awaits an eventual value with an unconfigured operation (empty retry set).
///
/// Usable only inside a [`run`](crate::run) closure.
#[track_caller]
pub fn await_value<T>(eventual: Eventual<T>) -> OpResult<T>
where
    T: Clone + Send + Sync + 'static,
{
    Op::new().await_value(eventual)
}

/// Runs a value-producing side-effect at most once across all attempts.
///
/// Usable only inside a [`run`](crate::run) closure.
#[track_caller]
pub fn once<T, F>(closure: F) -> OpResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Result<T, Error>,
{
    Op::new().perform(closure)
}

/// Runs a value-less side-effect at most once across all attempts.
///
/// Usable only inside a [`run`](crate::run) closure.
#[track_caller]
pub fn once_unit<F>(closure: F) -> OpResult<()>
where
    F: FnOnce() -> Result<(), Error>,
{
    Op::<()>::new().perform_unit(closure)
}

/// An unconfigured operation (empty retry set).
#[must_use]
pub fn op<T>() -> Op<T> {
    Op::new()
}

/// A builder for a configured operation.
#[must_use]
pub fn op_builder<T>() -> OpBuilder<T> {
    OpBuilder::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokenPromise;

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("flaky")]
    struct Flaky;

    #[test]
    fn unconfigured_op_retries_nothing() {
        let op = Op::<i32>::new();
        assert!(!op.is_retryable(&Error::user(Flaky)));
        assert!(!op.is_retryable(&Error::new(ErrorKind::User)));
    }

    #[test]
    fn retry_on_matches_source_type() {
        let op = Op::<i32>::builder().retry_on::<Flaky>().build();
        assert!(op.is_retryable(&Error::user(Flaky)));
        assert!(!op.is_retryable(&Error::user(BrokenPromise)));
        assert!(!op.is_retryable(&Error::new(ErrorKind::User)));
    }

    #[test]
    fn retry_on_kind_matches_kind() {
        let op = Op::<i32>::builder()
            .retry_on_kind(ErrorKind::BrokenPromise)
            .build();
        assert!(op.is_retryable(&Error::from(BrokenPromise)));
        assert!(!op.is_retryable(&Error::user(Flaky)));
    }

    #[test]
    fn predicates_accumulate() {
        let op = Op::<i32>::builder()
            .retry_on::<Flaky>()
            .retry_on_kind(ErrorKind::Cancelled)
            .build();
        assert!(op.is_retryable(&Error::user(Flaky)));
        assert!(op.is_retryable(&Error::new(ErrorKind::Cancelled)));
        assert!(!op.is_retryable(&Error::new(ErrorKind::User)));
    }

    #[test]
    fn ops_require_a_bound_context() {
        let err = match await_value(Eventual::resolved(1)) {
            Err(OpError::Fail(error)) => error,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(err.kind(), ErrorKind::NoContext);

        let err = match once(|| Ok(1)) {
            Err(OpError::Fail(error)) => error,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(err.kind(), ErrorKind::NoContext);

        let err = match once_unit(|| Ok(())) {
            Err(OpError::Fail(error)) => error,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(err.kind(), ErrorKind::NoContext);
    }

    #[test]
    fn debug_lists_retry_predicates() {
        let op = Op::<i32>::builder()
            .retry_on_kind(ErrorKind::Cancelled)
            .build();
        assert_eq!(format!("{op:?}"), r#"Op { retry_on: ["Cancelled"] }"#);
    }
}
