//! Error types for the dispatch worker pool.
//!
//! This module defines the central `Error` enum, which captures every failure
//! the pool surfaces to its callers. Nothing here is retried internally: each
//! variant either reports a broken caller contract or a pool that could not be
//! drained in time.
//!
//! ## Error Cases
//! - `InvalidState`: A lifecycle or membership operation was invoked outside
//!   the window in which it is allowed.
//! - `NoRuntime`: The pool was started outside a Tokio runtime, so it has
//!   nowhere to run workers.
//! - `Connect`: The connector refused to build a handle for an address.
//! - `ShutdownTimeout`: Workers were still alive when the drain deadline
//!   expired.

use crate::pool::State;
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the dispatch worker pool.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The operation is not permitted in the pool's current lifecycle state.
    #[error("Cannot {operation} while the pool is {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    /// No Tokio runtime was available to run workers on.
    #[error("Cannot {operation} outside a Tokio runtime")]
    NoRuntime { operation: &'static str },

    /// The connector could not produce a connection handle for the target.
    #[error("Connection to {address} could not be set up: {reason}")]
    Connect { address: String, reason: String },

    /// Workers did not exit within the allotted drain period.
    #[error("{remaining} worker(s) still running after {timeout:?}")]
    ShutdownTimeout { remaining: usize, timeout: Duration },
}
