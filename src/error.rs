//! Kernel error kinds
//!
//! Every failure a kernel call can report is a synchronous return value.
//! Contract violations (undersized stacks, aborting an essential thread)
//! are not represented here; they trip a debug assertion or the fatal path.

use thiserror::Error;

/// Result alias used by every fallible kernel call
pub type Result<T> = core::result::Result<T, KernelError>;

/// Error returned by kernel operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Cannot complete now and the caller asked not to wait
    #[error("operation would block")]
    WouldBlock,
    /// Bounded wait expired first
    #[error("wait timed out")]
    TimedOut,
    /// Resource held and a non-blocking attempt was made
    #[error("resource busy")]
    Busy,
    /// Malformed argument or object used outside its lifecycle
    #[error("invalid argument")]
    InvalidArgument,
    /// Pipe closed (or closed and drained)
    #[error("pipe closed")]
    Closed,
    /// Fixed-capacity structure is full
    #[error("capacity exhausted")]
    Exhausted,
    /// Wait was torn down by purge, reset or close
    #[error("wait cancelled")]
    Cancelled,
    /// Alarm is not in the scheduled or ready list
    #[error("alarm not scheduled")]
    NotScheduled,
    /// Deadline already passed and `ERROR_IF_LATE` was requested
    #[error("deadline already passed")]
    Late,
    /// Joining the caller itself, or a thread that is joining the caller
    #[error("join would deadlock")]
    Deadlock,
}
