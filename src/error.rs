//! Error types and error handling strategy for the replay runtime.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - The internal break signal is a variant of the operation sum, not an
//!   unwind; only the replay driver branches on it
//! - Determinism violations carry the prior attempt's remaining trace so the
//!   offending call sequence is visible in the message

use core::fmt;
use std::sync::Arc;

use crate::site::CallSite;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Replay contract ===
    /// The replayed operation sequence diverged from the prior attempt.
    Determinism,
    /// A committed trace was mutated, or the runtime was driven out of order.
    InvalidState,
    /// An operation primitive was used with no replay context bound.
    NoContext,

    // === Eventual values ===
    /// Advisory cancellation was honoured by the promise side.
    Cancelled,
    /// The promise was dropped before resolving its eventual.
    BrokenPromise,

    // === Internal / user ===
    /// Internal runtime error (a bug in this library).
    Internal,
    /// User-provided error.
    User,
}

/// The main error type for replay operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error is a replay-contract violation.
    #[must_use]
    pub const fn is_determinism(&self) -> bool {
        matches!(self.kind, ErrorKind::Determinism)
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Wraps a user-provided error.
    #[must_use]
    pub fn user(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }

    /// Creates an error from a structured determinism violation.
    #[must_use]
    pub fn determinism(violation: DeterminismError) -> Self {
        Self::new(ErrorKind::Determinism)
            .with_context(violation.to_string())
            .with_source(violation)
    }

    /// Creates an unbound-context error.
    #[must_use]
    pub fn no_context() -> Self {
        Self::new(ErrorKind::NoContext)
            .with_context("operation used outside a tokamak::run closure")
    }

    /// Returns the context text, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns the head of the source chain, if any.
    ///
    /// Unlike [`std::error::Error::source`], the returned reference keeps the
    /// `Send + Sync` bounds, so callers can downcast with `is` /
    /// `downcast_ref`.
    #[must_use]
    pub fn source_ref(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Returns the structured determinism violation, if this error carries one.
    #[must_use]
    pub fn determinism_violation(&self) -> Option<&DeterminismError> {
        self.source_ref()?.downcast_ref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Error observed by an eventual whose promise was dropped before resolving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("promise was dropped before resolving its eventual")]
pub struct BrokenPromise;

impl From<BrokenPromise> for Error {
    fn from(broken: BrokenPromise) -> Self {
        Self::new(ErrorKind::BrokenPromise).with_source(broken)
    }
}

/// The internal break control flow signal.
///
/// Raised (as [`OpError::Break`]) by an operation primitive to abort the
/// current attempt at a suspension point. The replay driver is the only
/// collaborator that may branch on it. The constructor is crate-private and
/// the type is neither `Clone` nor `Default`, so no instance can exist that
/// was not produced by an operation primitive — the type system plays the
/// role an identity check played in runtimes with catchable unwinding.
pub struct BreakSignal {
    _private: (),
}

impl BreakSignal {
    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }
}

impl fmt::Debug for BreakSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BreakSignal")
    }
}

impl fmt::Display for BreakSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            "internal break control flow signal; observing it outside the replay driver is a bug",
        )
    }
}

/// What an operation primitive can yield besides a value.
///
/// Every primitive returns `Result<T, OpError>` and user closures propagate
/// it with `?`, which is how the break signal travels from a suspension point
/// back to the attempt loop without unwinding.
#[derive(Debug)]
pub enum OpError {
    /// The attempt must be suspended and replayed.
    Break(BreakSignal),
    /// A user-visible failure.
    Fail(Error),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Break(signal) => write!(f, "{signal}"),
            Self::Fail(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Break(_) => None,
            Self::Fail(error) => Some(error),
        }
    }
}

impl From<Error> for OpError {
    fn from(error: Error) -> Self {
        Self::Fail(error)
    }
}

impl From<DeterminismError> for OpError {
    fn from(violation: DeterminismError) -> Self {
        Self::Fail(Error::determinism(violation))
    }
}

/// A specialized `Result` for operation primitives and `run` closures.
pub type OpResult<T> = core::result::Result<T, OpError>;

/// A replay-contract violation.
///
/// Raised when an attempt executes a different call site than the prior
/// attempt did at the same position, or returns before consuming every record
/// the prior attempt left behind. The rendered message enumerates the prior
/// remaining trace in order and names the side-effect fence as the remedy.
#[derive(Debug, Clone)]
pub struct DeterminismError {
    actual: Option<CallSite>,
    prior: Vec<CallSite>,
}

impl DeterminismError {
    /// A divergence: `actual` was executed where the prior attempt executed
    /// `prior[0]`, with `prior` listing everything from there to the end.
    #[must_use]
    pub fn diverged(actual: CallSite, prior: Vec<CallSite>) -> Self {
        Self {
            actual: Some(actual),
            prior,
        }
    }

    /// An early return: the attempt finished while `prior` records were still
    /// unconsumed.
    #[must_use]
    pub const fn returned_early(prior: Vec<CallSite>) -> Self {
        Self {
            actual: None,
            prior,
        }
    }

    /// The diverging call site, or `None` for an early return.
    #[must_use]
    pub const fn actual(&self) -> Option<CallSite> {
        self.actual
    }

    /// The prior attempt's remaining operations, in execution order.
    #[must_use]
    pub fn prior(&self) -> &[CallSite] {
        &self.prior
    }

    fn format_prior(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\n")?;
        for site in &self.prior {
            write!(f, "\n  - {site}")?;
        }
        f.write_str("\n\n")
    }
}

impl fmt::Display for DeterminismError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual {
            Some(actual) => write!(
                f,
                "Code is not deterministic; it now executed {actual} but last time it executed:"
            )?,
            None => f.write_str(
                "Code is not deterministic; it now returned early but last time the following \
                 operations were executed:",
            )?,
        }
        self.format_prior(f)?;
        f.write_str(
            "You need to remove the source of non-determinism; consider using tokamak::once()",
        )
    }
}

impl std::error::Error for DeterminismError {}

/// Extension trait for adding context to results carried through closures.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    fn site() -> CallSite {
        CallSite::capture()
    }

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::NoContext).with_context("unbound");
        assert_eq!(err.to_string(), "NoContext: unbound");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::user(Underlying).with_context("outer");
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
        assert!(err.source_ref().expect("source missing").is::<Underlying>());
    }

    #[test]
    fn determinism_divergence_message() {
        let a = site();
        let b = site();
        let violation = DeterminismError::diverged(b, vec![a, b, a]);
        let expected = format!(
            "Code is not deterministic; it now executed {b} but last time it executed:\
             \n\n  - {a}\n  - {b}\n  - {a}\n\n\
             You need to remove the source of non-determinism; consider using tokamak::once()"
        );
        assert_eq!(violation.to_string(), expected);
    }

    #[test]
    fn determinism_early_return_message() {
        let a = site();
        let violation = DeterminismError::returned_early(vec![a]);
        let expected = format!(
            "Code is not deterministic; it now returned early but last time the following \
             operations were executed:\n\n  - {a}\n\n\
             You need to remove the source of non-determinism; consider using tokamak::once()"
        );
        assert_eq!(violation.to_string(), expected);
    }

    #[test]
    fn determinism_error_round_trips_through_error() {
        let violation = DeterminismError::returned_early(vec![site()]);
        let err = Error::determinism(violation.clone());
        assert!(err.is_determinism());
        assert_eq!(err.context(), Some(violation.to_string().as_str()));
        let recovered = err.determinism_violation().expect("violation missing");
        assert_eq!(recovered.prior(), violation.prior());
    }

    #[test]
    fn broken_promise_converts() {
        let err: Error = BrokenPromise.into();
        assert_eq!(err.kind(), ErrorKind::BrokenPromise);
        assert!(err
            .source_ref()
            .expect("source missing")
            .is::<BrokenPromise>());
    }

    #[test]
    fn op_error_from_user_error() {
        let op: OpError = Error::user(Underlying).into();
        match op {
            OpError::Fail(error) => assert_eq!(error.kind(), ErrorKind::User),
            OpError::Break(_) => panic!("expected a failure"),
        }
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), BrokenPromise> = Err(BrokenPromise);
        let err = res
            .map_err(Error::from)
            .context("await failed")
            .expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::BrokenPromise);
        assert_eq!(err.to_string(), "BrokenPromise: await failed");
    }
}
