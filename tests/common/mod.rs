#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::Once;
use std::time::Duration;

use tokamak::{Error, Eventual};

static INIT_LOGGING: Once = Once::new();

/// How long integration tests wait for an eventual before giving up.
pub const WAIT_BUDGET: Duration = Duration::from_secs(5);

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Waits for an eventual within the test budget, panicking on timeout.
pub fn wait<T: Clone>(result: &Eventual<T>) -> Result<T, Error> {
    result
        .wait_timeout(WAIT_BUDGET)
        .expect("eventual did not resolve within the test budget")
}

/// A transient failure for retry tests.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("transient glitch")]
pub struct Glitch;

/// A persistent failure that must never be retried.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("hard failure")]
pub struct Hard;
