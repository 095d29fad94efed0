//! The ordered operation log for one closure invocation.
//!
//! A [`Trace`] is a path through the execution of a program. The state graph
//! is `new()/reset()` → `record()*` → `rollback()/commit()`.
//!
//! After a `rollback()`, it is only valid to `record` the same call sites
//! again in exactly the same order as last time, optionally followed by new
//! ones. Recording returns the same slot for operations that were already
//! traversed, and appends fresh slots past the end. After a `commit()`, only
//! `reset()` is valid.
//!
//! The trace assumes single-strand use; the owning context serialises access.

use std::any::Any;
use std::sync::Arc;

use crate::error::{DeterminismError, Error, ErrorKind};
use crate::site::CallSite;
use crate::tracing_compat::{debug, trace};

/// The memoised state of one record.
///
/// Transitions: `Unset → Future | Value | Done`, plus `Future → Value` when a
/// ready eventual's value is extracted and `Future → Unset` when a
/// retry-eligible failure forces the operation to re-execute. Everything else
/// is cleared only by [`Trace::reset`].
#[derive(Clone)]
pub(crate) enum Memo {
    /// The operation has not completed on any attempt.
    Unset,
    /// An awaited eventual, stored before its first readiness check.
    Future(Arc<dyn Any + Send + Sync>),
    /// The extracted result of a completed operation.
    Value(Arc<dyn Any + Send + Sync>),
    /// Completion marker for operations that produce no value.
    Done,
}

impl std::fmt::Debug for Memo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unset => "Unset",
            Self::Future(_) => "Future",
            Self::Value(_) => "Value",
            Self::Done => "Done",
        })
    }
}

/// One slot in the trace: a call site plus its memoised state.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    site: CallSite,
    memo: Memo,
}

impl Record {
    pub(crate) const fn site(&self) -> CallSite {
        self.site
    }
}

/// The ordered log of operation records for one in-flight invocation.
#[derive(Debug)]
pub(crate) struct Trace {
    // The longest observed execution path since the last reset.
    records: Vec<Record>,
    // Index of the next record to traverse. Equal to records.len() when the
    // next operation has not been performed on any attempt yet.
    cursor: usize,
    committed: bool,
}

impl Trace {
    pub(crate) const fn new() -> Self {
        Self {
            records: Vec::new(),
            cursor: 0,
            committed: false,
        }
    }

    /// Records that an operation executed at `site`.
    ///
    /// Returns the index of the record, following the prior attempt's path
    /// where one exists and appending past its end otherwise.
    pub(crate) fn record(&mut self, site: CallSite) -> Result<usize, Error> {
        self.check_not_committed()?;
        if self.cursor < self.records.len() {
            trace!("following existing trace");
            let expected = self.records[self.cursor].site;
            if expected != site {
                let prior = self.remainder().iter().map(Record::site).collect();
                debug!(%site, "trace diverged");
                return Err(Error::determinism(DeterminismError::diverged(site, prior)));
            }
        } else {
            trace!("appending new operation");
            self.records.push(Record {
                site,
                memo: Memo::Unset,
            });
        }
        let index = self.cursor;
        self.cursor += 1;
        Ok(index)
    }

    /// Rolls back, expecting the same series of operations to be re-tried.
    pub(crate) fn rollback(&mut self) -> Result<(), Error> {
        self.check_not_committed()?;
        trace!("rolling back");
        self.cursor = 0;
        Ok(())
    }

    /// Commits, expecting all interactions to be done until the next
    /// [`reset`](Self::reset).
    pub(crate) fn commit(&mut self) -> Result<(), Error> {
        self.check_not_committed()?;
        if self.cursor != self.records.len() {
            let prior = self.remainder().iter().map(Record::site).collect();
            debug!("attempt returned early");
            return Err(Error::determinism(DeterminismError::returned_early(prior)));
        }
        trace!("committing");
        self.committed = true;
        Ok(())
    }

    /// Resets to the state the trace had at construction time.
    pub(crate) fn reset(&mut self) {
        trace!("resetting");
        self.records.clear();
        self.cursor = 0;
        self.committed = false;
    }

    /// A clone of the memo at `index`.
    pub(crate) fn memo(&self, index: usize) -> Memo {
        self.records[index].memo.clone()
    }

    /// Stores an eventual's handle into an unset slot.
    pub(crate) fn store_future(&mut self, index: usize, handle: Arc<dyn Any + Send + Sync>) {
        debug_assert!(matches!(self.records[index].memo, Memo::Unset));
        self.records[index].memo = Memo::Future(handle);
    }

    /// Memoises the extracted value of a completed operation.
    pub(crate) fn memoise_value(&mut self, index: usize, value: Arc<dyn Any + Send + Sync>) {
        debug_assert!(matches!(
            self.records[index].memo,
            Memo::Unset | Memo::Future(_)
        ));
        self.records[index].memo = Memo::Value(value);
    }

    /// Memoises completion of a value-less operation.
    pub(crate) fn memoise_done(&mut self, index: usize) {
        debug_assert!(matches!(self.records[index].memo, Memo::Unset));
        self.records[index].memo = Memo::Done;
    }

    /// Clears a stored handle so the operation re-executes on the next
    /// attempt. Used when a retry-eligible failure was observed.
    pub(crate) fn clear_memo(&mut self, index: usize) {
        debug_assert!(matches!(self.records[index].memo, Memo::Future(_)));
        self.records[index].memo = Memo::Unset;
    }

    // Records from the cursor to the end: what the prior attempt executed
    // beyond the point the current attempt has reached.
    fn remainder(&self) -> &[Record] {
        &self.records[self.cursor..]
    }

    fn check_not_committed(&self) -> Result<(), Error> {
        if self.committed {
            return Err(Error::new(ErrorKind::InvalidState).with_context("trace is committed"));
        }
        Ok(())
    }
}
