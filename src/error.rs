//! Error types returned by blocking and scheduling operations.

use thiserror::Error;

/// Returned by interruptible blocking operations when the waiting thread
/// was interrupted via [`Interrupter::interrupt`](crate::interrupt::Interrupter::interrupt).
///
/// The thread's interruption status is cleared when this error is returned.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Error)]
#[error("thread was interrupted while waiting")]
pub struct Interrupted;

/// Reasons a task cannot be accepted by a [`Scheduler`](crate::scheduler::Scheduler).
#[cfg(feature = "scheduler")]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ScheduleError {
    /// Scheduler was shut down before the task was submitted.
    #[error("scheduler is shut down, task rejected")]
    Rejected,

    /// Periodic task was given a zero period.
    #[error("period of a periodic task must be greater than zero")]
    InvalidPeriod,
}

/// Reasons a [`TaskHandle`](crate::scheduled::TaskHandle) did not yield a value.
#[cfg(feature = "scheduler")]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    /// Job panicked, the panic was caught by the worker.
    #[error("task panicked")]
    Panicked,

    #[error("thread was interrupted while waiting for the task")]
    Interrupted,

    #[error("task did not complete in time")]
    TimedOut,
}

#[cfg(feature = "scheduler")]
impl From<Interrupted> for TaskError {
    fn from(_: Interrupted) -> Self {
        TaskError::Interrupted
    }
}
