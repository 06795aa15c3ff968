//! Scheduler dispatch loop and run/stop protocol.

use crate::context::{Context, TaskContext};
use crate::event_loop::EventLoop;
use crate::list::FifoQueue;
use crate::scheduler::stack;
use crate::task::{
    Continuation, Fiber, FnFiber, Resume, Step, Task, TaskHandle, TaskId, TaskOp, TaskState,
};
use crate::value::Value;
use crate::{SchedulerError, SchedulerResult, TaskError, TaskOutcome};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier for a registered shutdown callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShutdownId(u64);

static NEXT_SHUTDOWN_ID: AtomicU64 = AtomicU64::new(1);

impl ShutdownId {
    fn new() -> Self {
        ShutdownId(NEXT_SHUTDOWN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Dispatch statistics for a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks entered through their Start operation.
    pub started: u64,
    /// Fiber resumptions after suspension.
    pub resumed: u64,
    /// Tasks that reached the Resolved state.
    pub resolved: u64,
    /// Tasks that reached the Failed state.
    pub failed: u64,
}

type ShutdownCallback = Box<dyn FnOnce(TaskError) + Send>;

struct Inner {
    tasks: FxHashMap<TaskId, Task>,
    ready: FifoQueue<TaskId>,
    suspended: FifoQueue<TaskId>,
    /// A blocking run is in progress.
    running: bool,
    /// A dispatch pass is in progress (reentrancy guard).
    dispatching: bool,
    /// The activate hook is currently executing.
    activating: bool,
    /// The activate hook fires on the next idle-to-nonempty transition.
    activate: bool,
    /// The ready queue was touched since the last completed run.
    modified: bool,
    /// Suspended tasks that require the host loop to stay alive.
    keep_alive: usize,
    shutdown: Vec<(ShutdownId, ShutdownCallback)>,
    stats: SchedulerStats,
}

impl Inner {
    fn new() -> Self {
        Self {
            tasks: FxHashMap::default(),
            ready: FifoQueue::new(),
            suspended: FifoQueue::new(),
            running: false,
            dispatching: false,
            activating: false,
            activate: true,
            modified: true,
            keep_alive: 0,
            shutdown: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }
}

/// Move a task into a terminal state and collect its continuations.
///
/// Returns the continuations to notify together with the outcome to hand
/// them; both must be delivered after the scheduler lock is released.
fn finish_task(inner: &mut Inner, id: TaskId, outcome: TaskOutcome) -> (Vec<Continuation>, TaskOutcome) {
    let task = inner.tasks.get_mut(&id).expect("finished task missing from arena");
    task.op = TaskOp::None;
    task.fiber = None;
    task.resume_with = None;
    task.state = if outcome.is_ok() {
        inner.stats.resolved += 1;
        TaskState::Resolved
    } else {
        inner.stats.failed += 1;
        TaskState::Failed
    };
    task.outcome = Some(outcome.clone());
    let continuations = std::mem::take(&mut task.continuations);
    if !continuations.is_empty() {
        task.observed = true;
    }
    if task.detached {
        drop_task_entry(inner, id);
    }
    (continuations, outcome)
}

/// Remove a terminal task entry, surfacing a discarded failure.
fn drop_task_entry(inner: &mut Inner, id: TaskId) {
    if let Some(task) = inner.tasks.remove(&id) {
        if !task.observed {
            if let Some(Err(error)) = &task.outcome {
                log::warn!("task {} failed without an observer: {}", id.as_u64(), error);
            }
        }
    }
}

/// Handle to a cooperative task scheduler.
///
/// Cloning yields another handle to the same scheduler. All dispatching is
/// single-threaded and cooperative; a scheduler must be driven from the
/// thread that owns it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    driver: Option<Arc<dyn EventLoop>>,
}

impl Scheduler {
    /// Create a self-dispatching scheduler (no host event loop).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            driver: None,
        }
    }

    /// Create a scheduler embedded into a host event loop.
    pub fn with_event_loop(driver: Arc<dyn EventLoop>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            driver: Some(driver),
        }
    }

    /// Check whether this scheduler embeds a host event loop.
    pub fn has_event_loop(&self) -> bool {
        self.driver.is_some()
    }

    /// Number of tasks waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Number of tasks parked in the suspended queue.
    pub fn suspended_len(&self) -> usize {
        self.inner.lock().suspended.len()
    }

    /// Number of suspended tasks the host loop must stay alive for.
    ///
    /// A host loop with pending ready work or a non-zero keep-alive count
    /// should block waiting for more events; otherwise it may return.
    pub fn keep_alive(&self) -> usize {
        self.inner.lock().keep_alive
    }

    /// Check whether a blocking run is in progress.
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Snapshot of the dispatch statistics.
    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats
    }

    /// Submit a fiber for execution under `context`.
    ///
    /// The task is created in the Init state and immediately enqueued as
    /// ready with the Start operation. If enqueueing fails (the host loop's
    /// activate hook reported an error), the task is left Failed with that
    /// error and the returned handle observes it.
    pub fn submit(&self, fiber: Box<dyn Fiber>, context: Context) -> TaskHandle {
        let task = Task::new(fiber, context);
        let id = task.id;
        self.inner.lock().tasks.insert(id, task);
        self.enqueue(id);
        TaskHandle::new(id, self.clone())
    }

    /// Submit a run-to-completion closure under a default context.
    pub fn spawn<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce(&mut TaskContext) -> Result<Value, TaskError> + Send + 'static,
    {
        self.submit(Box::new(FnFiber::new(f)), Context::default())
    }

    /// Wake a suspended task with the outcome of its operation record.
    ///
    /// Used by resources after resolving records on their wait queues.
    /// Returns `false` if the task is not currently suspended. Note that a
    /// running task cannot be woken: a fiber that causes its own pending
    /// record to resolve before it returns its suspend step loses the
    /// resolution and suspends forever.
    pub fn wake(&self, task: TaskId, outcome: TaskOutcome) -> bool {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(entry) = inner.tasks.get_mut(&task) else {
                return false;
            };
            if entry.state != TaskState::Suspended {
                return false;
            }
            entry.resume_with = Some(match outcome {
                Ok(value) => Resume::Value(value),
                Err(error) => Resume::Err(error),
            });
        }
        self.enqueue(task)
    }

    /// Move a task into the ready queue.
    ///
    /// Init tasks are enqueued with the Start operation, suspended tasks are
    /// detached from the suspended queue and enqueued with Resume; any other
    /// state is a no-op. When the scheduler embeds an idle host loop, the
    /// loop's activate hook runs first; a hook failure rolls the enqueue
    /// back, leaving the task Failed.
    pub(crate) fn enqueue(&self, id: TaskId) -> bool {
        let run_activate = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let state = match inner.tasks.get(&id) {
                Some(task) => task.state,
                None => return false,
            };
            match state {
                TaskState::Init => {
                    inner
                        .tasks
                        .get_mut(&id)
                        .expect("task vanished")
                        .op = TaskOp::Start;
                }
                TaskState::Suspended => {
                    {
                        let task = inner.tasks.get_mut(&id).expect("task vanished");
                        task.op = TaskOp::Resume;
                        if task.counted {
                            task.counted = false;
                            inner.keep_alive -= 1;
                        }
                    }
                    inner.suspended.detach(&mut inner.tasks, id);
                }
                _ => return false,
            }
            inner.modified = true;
            if self.driver.is_some() && inner.activate && !inner.dispatching {
                inner.activate = false;
                inner.activating = true;
                true
            } else {
                inner.ready.push(&mut inner.tasks, id);
                inner.tasks.get_mut(&id).expect("task vanished").state = TaskState::Ready;
                false
            }
        };

        if !run_activate {
            return true;
        }

        let driver = self.driver.as_ref().expect("activate without event loop");
        let result = driver.activate(self);

        let notify = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.activating = false;
            match result {
                Ok(()) => {
                    inner.ready.push(&mut inner.tasks, id);
                    inner.tasks.get_mut(&id).expect("task vanished").state = TaskState::Ready;
                    None
                }
                Err(error) => {
                    // Roll back: the host loop could not be woken, so the
                    // task must not sit in the ready queue.
                    inner.activate = true;
                    Some(finish_task(inner, id, Err(error)))
                }
            }
        };

        match notify {
            None => true,
            Some((continuations, outcome)) => {
                for continuation in continuations {
                    continuation(id, &outcome);
                }
                false
            }
        }
    }

    /// One full dispatch pass: pop and run ready tasks until none remain.
    fn dispatch_pass(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.dispatching {
                panic!("Cannot dispatch tasks because the dispatcher is already running");
            }
            inner.dispatching = true;
        }

        loop {
            let (id, fiber, input, context) = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                let Some(id) = inner.ready.pop(&mut inner.tasks) else {
                    inner.dispatching = false;
                    break;
                };
                let task = inner.tasks.get_mut(&id).expect("ready task missing from arena");
                debug_assert!(task.op != TaskOp::None);
                let input = match task.op {
                    TaskOp::Start => {
                        inner.stats.started += 1;
                        Resume::Start
                    }
                    _ => {
                        inner.stats.resumed += 1;
                        task.resume_with.take().unwrap_or(Resume::Value(Value::Null))
                    }
                };
                task.op = TaskOp::None;
                task.state = TaskState::Running;
                (id, task.fiber.take(), input, task.context.clone())
            };

            let Some(mut fiber) = fiber else {
                let (continuations, outcome) = {
                    let mut guard = self.inner.lock();
                    finish_task(
                        &mut *guard,
                        id,
                        Err(TaskError::msg("task has no fiber to execute")),
                    )
                };
                for continuation in continuations {
                    continuation(id, &outcome);
                }
                continue;
            };

            let mut cx = TaskContext::new(id, self.clone(), context);
            let step = fiber.resume(&mut cx, input);

            let notify = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                match step {
                    Ok(Step::Complete(value)) => Some(finish_task(inner, id, Ok(value))),
                    Ok(step @ (Step::Suspend | Step::SuspendBackground)) => {
                        let task = inner.tasks.get_mut(&id).expect("task vanished");
                        let background =
                            step == Step::SuspendBackground || task.context.is_background();
                        task.fiber = Some(fiber);
                        task.state = TaskState::Suspended;
                        if !background {
                            task.counted = true;
                            inner.keep_alive += 1;
                        }
                        inner.suspended.push(&mut inner.tasks, id);
                        None
                    }
                    Err(error) => Some(finish_task(inner, id, Err(error))),
                }
            };

            if let Some((continuations, outcome)) = notify {
                for continuation in continuations {
                    continuation(id, &outcome);
                }
            }
        }
    }

    /// Run the scheduler until its ready queue drains.
    ///
    /// Self-dispatching schedulers run one dispatch pass directly; embedded
    /// schedulers delegate to the host loop's run hook. Duplicate runs and
    /// runs from inside a dispatch pass are fatal.
    pub(crate) fn run_loop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.running {
                panic!("Duplicate scheduler loop run detected");
            }
            if inner.dispatching {
                panic!("Cannot run loop while dispatching");
            }
            inner.running = true;
        }

        let _current = stack::enter(self.clone());

        match &self.driver {
            Some(driver) => {
                if let Err(error) = driver.run_loop(self) {
                    log::warn!("event loop terminated with an error: {}", error);
                    self.dispose();
                }
            }
            None => self.dispatch_pass(),
        }

        let mut inner = self.inner.lock();
        inner.running = false;
        inner.modified = false;
    }

    /// Perform exactly one dispatch pass on behalf of the host loop.
    ///
    /// Usage errors: calling while a pass is already in progress, while the
    /// scheduler is not inside an active run, or from inside the activate
    /// hook (the hook must only schedule a future dispatch).
    pub fn dispatch(&self) -> SchedulerResult<()> {
        {
            let inner = self.inner.lock();
            if inner.dispatching {
                return Err(SchedulerError::AlreadyDispatching);
            }
            if !inner.running {
                return Err(SchedulerError::NotRunning);
            }
            if inner.activating {
                return Err(SchedulerError::DispatchInActivate);
            }
        }

        let _current = stack::enter(self.clone());
        self.dispatch_pass();

        // Re-arm the wake notification for the next idle-to-nonempty
        // transition.
        self.inner.lock().activate = true;
        Ok(())
    }

    /// Ask the host loop to unwind an in-progress run.
    ///
    /// Stopping a loop scheduler that is not running is fatal. On a
    /// self-dispatching scheduler this is a no-op.
    pub fn stop(&self) {
        if let Some(driver) = &self.driver {
            if !self.inner.lock().running {
                panic!("Cannot stop scheduler loop that is not running");
            }
            driver.stop_loop(self);
        }
    }

    /// Submit `fiber` and drive the scheduler until its result is available.
    ///
    /// Returns the resolved value, re-raises the task's failure, or reports
    /// [`SchedulerError::Unresolved`] if the task somehow ended in a
    /// non-terminal state. The scheduler is drained (disposed) in the
    /// process.
    pub fn run_task(&self, fiber: Box<dyn Fiber>) -> SchedulerResult<Value> {
        self.run_task_with_context(Context::default(), fiber)
    }

    /// Like [`Scheduler::run_task`] with an explicit context.
    pub fn run_task_with_context(
        &self,
        context: Context,
        fiber: Box<dyn Fiber>,
    ) -> SchedulerResult<Value> {
        if self.inner.lock().running {
            return Err(SchedulerError::AlreadyRunning);
        }
        let handle = self.submit(fiber, context);
        self.dispose();
        match handle.take_result() {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(SchedulerError::Task(error)),
            None => Err(SchedulerError::Unresolved),
        }
    }

    /// Drain the scheduler, failing everything still pending.
    ///
    /// Shutdown callbacks run first so open resources fail their waiters
    /// with the shutdown error; the loop then runs once when there is
    /// undispatched work, and every task still queued afterwards is
    /// force-failed. Safe to call multiple times; fatal when called from
    /// inside the scheduler's own dispatch loop.
    pub fn dispose(&self) {
        if self.inner.lock().dispatching {
            panic!("Cannot dispose a scheduler from inside its own dispatch loop");
        }

        let _current = stack::enter(self.clone());

        let callbacks: Vec<ShutdownCallback> = {
            let mut inner = self.inner.lock();
            inner.shutdown.drain(..).map(|(_, cb)| cb).collect()
        };
        for callback in callbacks {
            callback(TaskError::SchedulerShutdown);
        }

        let should_run = {
            let inner = self.inner.lock();
            !inner.running && inner.modified
        };
        if should_run {
            self.run_loop();
        }

        loop {
            let (id, continuations, outcome) = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                let id = match inner.ready.pop(&mut inner.tasks) {
                    Some(id) => Some(id),
                    None => inner.suspended.pop(&mut inner.tasks),
                };
                let Some(id) = id else {
                    break;
                };
                {
                    let task = inner.tasks.get_mut(&id).expect("queued task missing from arena");
                    if task.counted {
                        task.counted = false;
                        inner.keep_alive -= 1;
                    }
                }
                let (continuations, outcome) =
                    finish_task(inner, id, Err(TaskError::SchedulerShutdown));
                (id, continuations, outcome)
            };
            for continuation in continuations {
                continuation(id, &outcome);
            }
        }
    }

    /// Register a callback invoked when this scheduler is disposed.
    ///
    /// Resources use this to close themselves with a shutdown error instead
    /// of leaking open event sources.
    pub fn on_shutdown<F>(&self, callback: F) -> ShutdownId
    where
        F: FnOnce(TaskError) + Send + 'static,
    {
        let id = ShutdownId::new();
        self.inner.lock().shutdown.push((id, Box::new(callback)));
        id
    }

    /// Remove a shutdown registration before it fires.
    pub fn clear_shutdown(&self, id: ShutdownId) {
        self.inner.lock().shutdown.retain(|(entry, _)| *entry != id);
    }

    /// Check whether two handles refer to the same scheduler.
    pub fn same(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_modified(&self) {
        self.inner.lock().modified = true;
    }

    // Handle support.

    pub(crate) fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.lock().tasks.get(&id).map(|task| task.state)
    }

    pub(crate) fn task_result(&self, id: TaskId) -> Option<TaskOutcome> {
        let mut inner = self.inner.lock();
        let task = inner.tasks.get_mut(&id)?;
        let outcome = task.outcome.clone()?;
        task.observed = true;
        Some(outcome)
    }

    pub(crate) fn take_task_result(&self, id: TaskId) -> Option<TaskOutcome> {
        let mut inner = self.inner.lock();
        let terminal = inner
            .tasks
            .get(&id)
            .map(|task| task.state.is_terminal())
            .unwrap_or(false);
        if !terminal {
            return None;
        }
        inner.tasks.remove(&id).and_then(|task| task.outcome)
    }

    pub(crate) fn add_continuation(&self, id: TaskId, continuation: Continuation) {
        let ready = {
            let mut inner = self.inner.lock();
            match inner.tasks.get_mut(&id) {
                Some(task) if task.state.is_terminal() => {
                    task.observed = true;
                    task.outcome.clone()
                }
                Some(task) => {
                    task.continuations.push(continuation);
                    return;
                }
                None => return,
            }
        };
        if let Some(outcome) = ready {
            continuation(id, &outcome);
        }
    }

    /// Cancel a task waiting in the ready or suspended queue.
    pub(crate) fn cancel(&self, id: TaskId, error: TaskError) -> bool {
        let notify = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let state = match inner.tasks.get(&id) {
                Some(task) => task.state,
                None => return false,
            };
            match state {
                TaskState::Ready => {
                    inner.ready.detach(&mut inner.tasks, id);
                }
                TaskState::Suspended => {
                    {
                        let task = inner.tasks.get_mut(&id).expect("task vanished");
                        if task.counted {
                            task.counted = false;
                            inner.keep_alive -= 1;
                        }
                    }
                    inner.suspended.detach(&mut inner.tasks, id);
                }
                _ => return false,
            }
            finish_task(inner, id, Err(error))
        };
        let (continuations, outcome) = notify;
        for continuation in continuations {
            continuation(id, &outcome);
        }
        true
    }

    /// Release the external owner's reference to a task entry.
    pub(crate) fn release(&self, id: TaskId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return;
        };
        if task.state.is_terminal() {
            drop_task_entry(inner, id);
        } else {
            task.detached = true;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Scheduler {}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("event_loop", &self.driver.is_some())
            .finish_non_exhaustive()
    }
}
