//! Execution contexts carried by tasks and handed to running fibers.

use crate::scheduler::Scheduler;
use crate::task::{TaskHandle, TaskId};
use crate::value::Value;
use crate::TaskError;

/// Options a task inherits at submission time.
///
/// A background context marks every wait the task enters as not required to
/// keep a host event loop running (see the keep-alive counter on
/// [`Scheduler`]).
#[derive(Debug, Clone, Default)]
pub struct Context {
    background: bool,
}

impl Context {
    /// Create a foreground context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a background context: waits entered under it never hold the
    /// host loop open.
    pub fn background() -> Self {
        Self { background: true }
    }

    /// Check whether this context is background.
    pub fn is_background(&self) -> bool {
        self.background
    }
}

/// View of the scheduler a fiber sees for the duration of one resume call.
pub struct TaskContext {
    task: TaskId,
    scheduler: Scheduler,
    context: Context,
}

impl TaskContext {
    pub(crate) fn new(task: TaskId, scheduler: Scheduler, context: Context) -> Self {
        Self {
            task,
            scheduler,
            context,
        }
    }

    /// Id of the task currently executing.
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// The scheduler that owns the running task.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The context the task was submitted under.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Submit a run-to-completion closure onto the owning scheduler,
    /// inheriting this task's context.
    pub fn spawn<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce(&mut TaskContext) -> Result<Value, TaskError> + Send + 'static,
    {
        self.scheduler
            .submit(Box::new(crate::task::FnFiber::new(f)), self.context.clone())
    }
}
