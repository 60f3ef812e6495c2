//! Error taxonomy shared by every collection and the worker pool.
//!
//! The kinds mirror the JSR-166 failure modes: a null/invalid argument,
//! an operation attempted from the wrong state, a cancelled wait, an
//! elapsed timeout, a full bounded collection, a rejected task, and a
//! task's own uncaught failure surfacing through its handle.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Boxed payload of an uncaught task failure: either a propagated error
/// or a caught panic payload, whichever the task produced.
pub enum TaskFailure {
    Error(Box<dyn std::error::Error + Send + Sync + 'static>),
    Panic(Box<dyn Any + Send + 'static>),
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Error(e) => write!(f, "TaskFailure::Error({e})"),
            TaskFailure::Panic(_) => write!(f, "TaskFailure::Panic(..)"),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Error(e) => write!(f, "task failed: {e}"),
            TaskFailure::Panic(payload) => {
                if let Some(s) = payload.downcast_ref::<&str>() {
                    write!(f, "task panicked: {s}")
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    write!(f, "task panicked: {s}")
                } else {
                    write!(f, "task panicked")
                }
            }
        }
    }
}

/// Every failure mode described in the error-handling design.
#[derive(thiserror::Error, Debug)]
pub enum JunctureError {
    /// Null/absent element where disallowed, non-positive capacity,
    /// non-positive load factor, `core_pool_size > max_pool_size`, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted from a state that forbids it (e.g.
    /// `iterator.remove()` before `next()`, double-completing a future
    /// via a protected setter).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A blocking wait was cancelled, or an observer encountered a
    /// `CANCELLED`/`INTERRUPTED` future.
    #[error("operation cancelled")]
    Cancelled,

    /// A timed wait elapsed before the operation could complete.
    #[error("operation timed out")]
    Timeout,

    /// `add()` on a full bounded queue.
    #[error("collection at capacity")]
    CapacityFull,

    /// The pool cannot accept a task (shut down, or saturated under the
    /// `Abort` policy).
    #[error("task rejected by pool")]
    Rejected,

    /// A task's uncaught failure, surfaced through `Future::get`. Holds
    /// an `Arc` (rather than taking the `TaskFailure` by value) because
    /// every clone of a `JoinHandle` must be able to read the same
    /// failure from `get()`, not just the first caller.
    #[error("{0}")]
    ExecutionFailure(Arc<TaskFailure>),
}

impl From<TaskFailure> for JunctureError {
    fn from(failure: TaskFailure) -> Self {
        JunctureError::ExecutionFailure(Arc::new(failure))
    }
}

impl From<Arc<TaskFailure>> for JunctureError {
    fn from(failure: Arc<TaskFailure>) -> Self {
        JunctureError::ExecutionFailure(failure)
    }
}

pub type Result<T> = std::result::Result<T, JunctureError>;
