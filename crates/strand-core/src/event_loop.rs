//! Host event-loop embedding hooks.

use crate::scheduler::Scheduler;
use crate::TaskError;

/// Capability interface implemented by a host event-loop adapter.
///
/// A scheduler constructed with [`Scheduler::with_event_loop`] delegates its
/// blocking run to the adapter instead of dispatching directly, which lets
/// ready-task execution interleave with the host's I/O and timer waits.
pub trait EventLoop: Send + Sync {
    /// Wake the host loop because the ready queue went from idle to
    /// non-empty.
    ///
    /// Called at most once per such transition. The implementation must
    /// schedule a future [`Scheduler::dispatch`] call on the host loop and
    /// return without dispatching; dispatching synchronously from here is a
    /// usage error the scheduler rejects. A returned error rolls back the
    /// enqueue that triggered the call, leaving the task failed.
    fn activate(&self, scheduler: &Scheduler) -> Result<(), TaskError>;

    /// Block, repeatedly invoking [`Scheduler::dispatch`] as work becomes
    /// ready, until [`EventLoop::stop_loop`] unwinds it.
    ///
    /// A returned error disposes the scheduler.
    fn run_loop(&self, scheduler: &Scheduler) -> Result<(), TaskError>;

    /// Cause an in-progress [`EventLoop::run_loop`] to return.
    fn stop_loop(&self, scheduler: &Scheduler);
}
