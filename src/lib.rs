//! Tokamak: asynchronous execution of synchronous-looking code, by replay.
//!
//! # Overview
//!
//! Tokamak lets you write straight-line code that awaits asynchronous values
//! without language-level coroutines. The trick is deterministic replay: your
//! closure runs repeatedly, short-circuiting at the first unresolved value;
//! when that value resolves, the closure re-runs from the top with every
//! previously observed result memoised, so each attempt reaches strictly
//! further than the last. Async operations are expensive and synchronous
//! code is cheap — the runtime spends CPU on re-running the cheap part to
//! keep the API simple.
//!
//! # Core guarantees
//!
//! - **Replay consistency**: every [`once`] closure runs exactly once across
//!   all attempts; every [`await_value`] observes its eventual's resolved
//!   value.
//! - **Determinism detection**: an attempt that executes a different call
//!   site than the previous attempt did at the same position — or returns
//!   early — fails with [`DeterminismError`] listing the prior trace.
//! - **Single wake-up**: when an attempt blocks, the first completion to
//!   fire re-enters the loop; siblings are cancelled (advisory) and ignored.
//! - **No counterfeit breaks**: the internal suspension signal cannot be
//!   constructed outside this crate.
//!
//! # Module structure
//!
//! - [`site`]: call-site identity for replayed operations
//! - [`error`]: error taxonomy ([`Error`], [`DeterminismError`], [`OpError`])
//! - [`eventual`]: the eventual-value cell ([`Promise`] / [`Eventual`])
//! - [`op`]: the operation facade ([`Op`], [`await_value`], [`once`])
//! - the replay driver ([`run`]) and the per-strand context behind it
//!
//! # Example
//!
//! ```
//! use tokamak::{await_value, once, run, Eventual};
//!
//! let result = run(|| {
//!     let base = await_value(Eventual::resolved(40))?;
//!     let bump = once(|| Ok(2))?;
//!     Ok(base + bump)
//! });
//!
//! assert_eq!(result.wait().expect("run failed"), 42);
//! ```
//!
//! Since the closure is retried until every awaited value has resolved, mark
//! all side-effects that must happen once with [`once`] / [`once_unit`]:
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use tokamak::{await_value, once_unit, run, Eventual};
//!
//! let fetches = Arc::new(AtomicUsize::new(0));
//! let metric = Arc::clone(&fetches);
//!
//! let result = run(move || {
//!     let name = await_value(Eventual::resolved("tokamak".to_string()))?;
//!     once_unit(|| {
//!         metric.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     })?;
//!     Ok(name.len())
//! });
//!
//! assert_eq!(result.wait().expect("run failed"), 7);
//! assert_eq!(fetches.load(Ordering::SeqCst), 1);
//! ```

pub mod error;
pub mod eventual;
pub mod op;
pub mod site;

mod ambient;
mod context;
mod driver;
mod trace;

pub(crate) mod tracing_compat;

pub use driver::run;
pub use error::{
    BreakSignal, BrokenPromise, DeterminismError, Error, ErrorKind, OpError, OpResult, ResultExt,
};
pub use eventual::{pair, resolve_after, Eventual, Promise, Subscription};
pub use op::{await_value, once, once_unit, op, op_builder, Op, OpBuilder};
pub use site::CallSite;
