//! Strand Core Runtime
//!
//! This crate provides the cooperative execution core of the Strand runtime:
//! - Task lifecycle and the scheduler dispatch loop
//! - Operation wait-queues (the awaitable primitive every suspension point is
//!   built from)
//! - A thread-local scheduler stack for nested and embedded execution
//! - Keep-alive bookkeeping for host event-loop integration
//! - An example awaitable resource (signal watcher)
//!
//! Scheduling is single-threaded and cooperative: exactly one task's fiber
//! executes at a time per scheduler, and concurrency is interleaving through
//! explicit suspension. Multi-threaded programs run one independent scheduler
//! per thread.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod event_loop;
pub mod list;
pub mod op;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod value;

pub use context::{Context, TaskContext};
pub use event_loop::EventLoop;
pub use op::{OpId, OpQueue};
pub use scheduler::{stack, Scheduler, SchedulerStats, ShutdownId};
pub use signal::{SignalSource, SignalWatcher};
pub use task::{Fiber, FnFiber, Resume, Step, TaskHandle, TaskId, TaskState};
pub use value::Value;

/// Failure carried by a task or a pending operation.
///
/// This is the error that fibers report, operation records are failed with,
/// and resources latch as their terminal error. It is cheap to clone so a
/// single failure can be broadcast to every waiter of a resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// A fiber reported a failure while running.
    #[error("{0}")]
    Failed(String),

    /// The owning scheduler was torn down while work was still pending.
    #[error("Task scheduler has been shut down")]
    SchedulerShutdown,

    /// A watcher resource was closed while (or before) a task waited on it.
    #[error("Signal watcher has been closed")]
    WatcherClosed {
        /// Error that caused the watcher to close, if any.
        cause: Option<Box<TaskError>>,
    },

    /// The pending operation was cancelled before it could resolve.
    #[error("Operation has been cancelled")]
    Cancelled,
}

impl TaskError {
    /// Build an execution failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Scheduler usage errors.
///
/// These report programmer misuse synchronously to the caller and leave the
/// scheduler's internal state untouched. Invariant violations that cannot be
/// recovered from (duplicate loop runs, reentrant dispatch through internal
/// paths) panic instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// `run_task` called while a blocking run is already in progress.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// `dispatch` called while a dispatch pass is already in progress.
    #[error("Cannot dispatch tasks because the dispatcher is already running")]
    AlreadyDispatching,

    /// `dispatch` called while the scheduler is not inside an active run.
    #[error("Cannot dispatch tasks while the task scheduler is not running")]
    NotRunning,

    /// `dispatch` called from inside the event loop's activate hook.
    #[error("Cannot dispatch in activator, use your event loop instead")]
    DispatchInActivate,

    /// `stack::pop` called with no scheduler pushed.
    #[error("Cannot pop task scheduler that has not been pushed")]
    StackEmpty,

    /// `stack::pop` called with a scheduler that is not the current top.
    #[error("Cannot pop task scheduler because it is not the active scheduler")]
    NotStackTop,

    /// A run-to-completion task ended in a non-terminal state.
    #[error("Awaitable has not been resolved")]
    Unresolved,

    /// The task submitted through `run_task` failed.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Terminal outcome of a task: a resolved value or a failure.
pub type TaskOutcome = Result<Value, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_message() {
        let err = TaskError::msg("boom");
        assert_eq!(err, TaskError::Failed("boom".to_string()));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_watcher_closed_carries_cause() {
        let cause = TaskError::msg("device gone");
        let err = TaskError::WatcherClosed {
            cause: Some(Box::new(cause.clone())),
        };
        assert_eq!(err.to_string(), "Signal watcher has been closed");
        match err {
            TaskError::WatcherClosed { cause: Some(inner) } => assert_eq!(*inner, cause),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_scheduler_error_from_task_error() {
        let err: SchedulerError = TaskError::SchedulerShutdown.into();
        assert_eq!(err, SchedulerError::Task(TaskError::SchedulerShutdown));
    }
}
