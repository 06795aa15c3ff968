//! Task structure and the fiber execution protocol.

use crate::context::{Context, TaskContext};
use crate::list::{Linked, Links};
use crate::scheduler::Scheduler;
use crate::value::Value;
use crate::{TaskError, TaskOutcome};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId.
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never scheduled.
    Init,
    /// Waiting in the ready queue.
    Ready,
    /// Fiber currently executing.
    Running,
    /// Parked on an operation record.
    Suspended,
    /// Finished with a value.
    Resolved,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Check whether the state is terminal (Resolved or Failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Resolved | TaskState::Failed)
    }
}

/// What the dispatch loop will do with a ready task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TaskOp {
    /// Not in the ready queue.
    None,
    /// Enter the fiber for the first time.
    Start,
    /// Continue the fiber from its suspension point.
    Resume,
}

/// Input delivered when a fiber is entered or re-entered.
#[derive(Debug, Clone)]
pub enum Resume {
    /// First entry into the fiber.
    Start,
    /// The awaited operation resolved with a value.
    Value(Value),
    /// The awaited operation failed.
    Err(TaskError),
}

/// What a fiber did with its turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Ran to completion with a result.
    Complete(Value),
    /// Parked on an operation record; the wait keeps the host loop alive.
    Suspend,
    /// Parked on an operation record the host loop need not stay alive for
    /// (optional waits such as signals).
    SuspendBackground,
}

/// A resumable unit of cooperative execution.
///
/// The scheduler calls `resume` with [`Resume::Start`] the first time the
/// task is dispatched. A fiber suspends by registering an operation record on
/// some wait-queue and returning [`Step::Suspend`] (or
/// [`Step::SuspendBackground`]); when the record resolves, `resume` is called
/// again with the resolution as input. Returning an error puts the task into
/// the Failed state.
///
/// A fiber must not cause its own pending record to resolve before returning
/// its suspend step: the task is still running at that point, the wake is
/// lost, and the task then suspends with nothing left to wake it.
pub trait Fiber: Send {
    /// Run the fiber until it completes or suspends.
    fn resume(&mut self, cx: &mut TaskContext, input: Resume) -> Result<Step, TaskError>;
}

/// Fiber adapter for run-to-completion closures that never suspend.
pub struct FnFiber<F> {
    f: Option<F>,
}

impl<F> FnFiber<F>
where
    F: FnOnce(&mut TaskContext) -> Result<Value, TaskError> + Send,
{
    /// Wrap a closure as a single-step fiber.
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> Fiber for FnFiber<F>
where
    F: FnOnce(&mut TaskContext) -> Result<Value, TaskError> + Send,
{
    fn resume(&mut self, cx: &mut TaskContext, _input: Resume) -> Result<Step, TaskError> {
        match self.f.take() {
            Some(f) => f(cx).map(Step::Complete),
            None => Err(TaskError::msg("fiber resumed after completion")),
        }
    }
}

/// Callback notified when a task reaches a terminal state.
pub type Continuation = Box<dyn FnOnce(TaskId, &TaskOutcome) + Send>;

/// A task owned by a scheduler's arena.
///
/// The ready and suspended queues reference tasks by id through the intrusive
/// linkage; the fiber is taken out of the entry while it executes so the
/// scheduler lock is never held across user code.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) state: TaskState,
    pub(crate) op: TaskOp,
    pub(crate) fiber: Option<Box<dyn Fiber>>,
    pub(crate) resume_with: Option<Resume>,
    pub(crate) outcome: Option<TaskOutcome>,
    pub(crate) continuations: Vec<Continuation>,
    pub(crate) context: Context,
    pub(crate) links: Links<TaskId>,
    /// This suspension is counted toward the scheduler keep-alive total.
    pub(crate) counted: bool,
    /// The outcome was observed through a handle or a continuation.
    pub(crate) observed: bool,
    /// No live handle remains; the entry is dropped once terminal.
    pub(crate) detached: bool,
}

impl Task {
    pub(crate) fn new(fiber: Box<dyn Fiber>, context: Context) -> Self {
        Self {
            id: TaskId::new(),
            state: TaskState::Init,
            op: TaskOp::None,
            fiber: Some(fiber),
            resume_with: None,
            outcome: None,
            continuations: Vec::new(),
            context,
            links: Links::default(),
            counted: false,
            observed: false,
            detached: false,
        }
    }
}

impl Linked<TaskId> for Task {
    fn links(&self) -> &Links<TaskId> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<TaskId> {
        &mut self.links
    }
}

/// Owner-facing handle to a submitted task.
///
/// The handle is the unique external owner of the task's outcome: dropping it
/// releases the task entry once the task reaches a terminal state. Queues and
/// wait-queues only ever hold the task's id.
pub struct TaskHandle {
    id: TaskId,
    scheduler: Scheduler,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, scheduler: Scheduler) -> Self {
        Self { id, scheduler }
    }

    /// Id of the task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state, or `None` once the entry has been released.
    pub fn state(&self) -> Option<TaskState> {
        self.scheduler.task_state(self.id)
    }

    /// Clone the terminal outcome, if the task has reached one.
    pub fn result(&self) -> Option<TaskOutcome> {
        self.scheduler.task_result(self.id)
    }

    /// Take the terminal outcome, releasing the task entry.
    pub fn take_result(&self) -> Option<TaskOutcome> {
        self.scheduler.take_task_result(self.id)
    }

    /// Register a callback invoked when the task completes.
    ///
    /// If the task is already terminal the callback runs immediately.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(TaskId, &TaskOutcome) + Send + 'static,
    {
        self.scheduler.add_continuation(self.id, Box::new(f));
    }

    /// Cancel the task while it waits in the ready or suspended queue.
    ///
    /// Returns `false` if the task is running, already terminal, or gone.
    pub fn cancel(&self, error: TaskError) -> bool {
        self.scheduler.cancel(self.id, error)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.scheduler.release(self.id);
    }
}
