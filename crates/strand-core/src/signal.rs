//! Signal watcher: an awaitable resource built on the operation wait-queue.
//!
//! The watcher shows the full resource pattern: tasks subscribe and suspend,
//! a delivery broadcasts the signal number to everyone present, the terminal
//! error latches on close, and scheduler shutdown closes the watcher so its
//! waiters fail instead of leaking. The underlying event source is activated
//! lazily on the first waiter and stopped again when a delivery drains the
//! queue. Waits are background waits; a pending signal subscription alone
//! never keeps a host event loop alive.

use crate::context::TaskContext;
use crate::op::{OpId, OpQueue};
use crate::scheduler::{Scheduler, ShutdownId};
use crate::task::{Fiber, Resume, Step, TaskId};
use crate::value::Value;
use crate::TaskError;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Hangup detected on controlling terminal.
pub const SIGHUP: i32 = 1;
/// Interrupt from keyboard.
pub const SIGINT: i32 = 2;
/// Quit from keyboard.
pub const SIGQUIT: i32 = 3;
/// User-defined signal 1.
pub const SIGUSR1: i32 = 10;
/// User-defined signal 2.
pub const SIGUSR2: i32 = 12;
/// Termination request.
pub const SIGTERM: i32 = 15;

/// Host-side registration of interest in an OS signal.
///
/// The watcher core is host-agnostic: delivery is whatever calls
/// [`SignalWatcher::deliver`]. An embedding that owns a real signal backend
/// implements this trait so watchers register and unregister with it. The
/// watcher registers lazily, when its first waiter arrives, and unregisters
/// as soon as it has no more use for the source.
pub trait SignalSource: Send + Sync {
    /// Start routing `signum` deliveries to the registering watcher.
    fn register(&self, signum: i32) -> Result<(), TaskError>;

    /// Stop routing `signum`.
    fn unregister(&self, signum: i32);
}

struct Registration {
    source: Option<Arc<dyn SignalSource>>,
    /// The source is currently registered for this watcher's signal.
    active: bool,
}

struct Shared {
    waiters: Mutex<OpQueue>,
    registration: Mutex<Registration>,
}

/// Awaitable watcher for one signal number.
pub struct SignalWatcher {
    signum: i32,
    scheduler: Scheduler,
    shared: Arc<Shared>,
    shutdown: Mutex<Option<ShutdownId>>,
}

impl SignalWatcher {
    /// Create a watcher for `signum` on `scheduler` without a host source.
    ///
    /// Deliveries come from explicit [`SignalWatcher::deliver`] calls. Fails
    /// when the signal number is not supported.
    pub fn new(scheduler: &Scheduler, signum: i32) -> Result<Self, TaskError> {
        Self::build(scheduler, signum, None)
    }

    /// Create a watcher backed by a host signal source.
    ///
    /// The source is not registered yet; registration happens when the first
    /// waiter subscribes.
    pub fn with_source(
        scheduler: &Scheduler,
        signum: i32,
        source: Arc<dyn SignalSource>,
    ) -> Result<Self, TaskError> {
        Self::build(scheduler, signum, Some(source))
    }

    fn build(
        scheduler: &Scheduler,
        signum: i32,
        source: Option<Arc<dyn SignalSource>>,
    ) -> Result<Self, TaskError> {
        if !Self::is_supported(signum) {
            return Err(TaskError::msg(format!(
                "Signal {} is not supported",
                signum
            )));
        }

        let shared = Arc::new(Shared {
            waiters: Mutex::new(OpQueue::new()),
            registration: Mutex::new(Registration {
                source,
                active: false,
            }),
        });
        let shutdown = scheduler.on_shutdown({
            let shared = Arc::downgrade(&shared);
            let scheduler = scheduler.clone();
            move |error| close_shared(&scheduler, &shared, signum, Some(error))
        });

        Ok(Self {
            signum,
            scheduler: scheduler.clone(),
            shared,
            shutdown: Mutex::new(Some(shutdown)),
        })
    }

    /// Check whether `signum` can be watched.
    pub fn is_supported(signum: i32) -> bool {
        matches!(signum, SIGHUP | SIGINT | SIGQUIT | SIGUSR1 | SIGUSR2 | SIGTERM)
    }

    /// The watched signal number.
    pub fn signum(&self) -> i32 {
        self.signum
    }

    /// Number of tasks currently waiting for a delivery.
    pub fn waiting(&self) -> usize {
        self.shared.waiters.lock().len()
    }

    /// Check whether the watcher has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.waiters.lock().is_closed()
    }

    /// Register `task` to be woken by the next delivery.
    ///
    /// The first waiter since the watcher went idle activates the host
    /// source; a source failure rolls the subscription back. On a closed
    /// watcher the latched error is returned instead.
    pub fn subscribe(&self, task: TaskId) -> Result<OpId, TaskError> {
        let op = self.shared.waiters.lock().enqueue(task)?;
        if let Err(error) = self.activate_source() {
            self.shared.waiters.lock().cancel(op);
            return Err(error);
        }
        self.scheduler.mark_modified();
        Ok(op)
    }

    /// Subscribe the running task and suspend it until delivery.
    ///
    /// Intended for use from inside a fiber:
    ///
    /// ```ignore
    /// fn resume(&mut self, cx: &mut TaskContext, input: Resume) -> Result<Step, TaskError> {
    ///     match input {
    ///         Resume::Start => self.watcher.await_signal(cx.task_id()),
    ///         Resume::Value(signum) => Ok(Step::Complete(signum)),
    ///         Resume::Err(error) => Err(error),
    ///     }
    /// }
    /// ```
    pub fn await_signal(&self, task: TaskId) -> Result<Step, TaskError> {
        self.subscribe(task)?;
        Ok(Step::SuspendBackground)
    }

    /// Drop a pending subscription without waking its task.
    pub fn unsubscribe(&self, op: OpId) -> bool {
        self.shared.waiters.lock().cancel(op)
    }

    /// Deliver one occurrence of the signal.
    ///
    /// Every task waiting at delivery time is woken with the signal number;
    /// tasks that subscribe while the wakes are delivered wait for the next
    /// occurrence. A delivery that drains the queue stops the host source
    /// until the next waiter arrives. Returns the number of tasks woken.
    pub fn deliver(&self) -> usize {
        let (wakes, drained) = {
            let mut queue = self.shared.waiters.lock();
            let wakes = queue.broadcast(Value::Int(self.signum as i64));
            let drained = queue.is_empty();
            (wakes, drained)
        };
        if drained {
            self.deactivate_source();
        }
        let delivered = wakes.len();
        for (task, outcome) in wakes {
            self.scheduler.wake(task, outcome);
        }
        delivered
    }

    /// Close the watcher, failing every pending and future subscription.
    ///
    /// The first close wins; `cause` (if any) is carried inside the latched
    /// [`TaskError::WatcherClosed`]. A still-active source is unregistered.
    /// Idempotent.
    pub fn close(&self, cause: Option<TaskError>) {
        if let Some(id) = self.shutdown.lock().take() {
            self.scheduler.clear_shutdown(id);
        }
        close_shared(
            &self.scheduler,
            &Arc::downgrade(&self.shared),
            self.signum,
            cause,
        );
    }

    fn activate_source(&self) -> Result<(), TaskError> {
        let source = {
            let registration = self.shared.registration.lock();
            if registration.active {
                return Ok(());
            }
            match &registration.source {
                Some(source) => source.clone(),
                None => return Ok(()),
            }
        };
        source.register(self.signum)?;
        self.shared.registration.lock().active = true;
        Ok(())
    }

    fn deactivate_source(&self) {
        let source = {
            let mut registration = self.shared.registration.lock();
            if !registration.active {
                return;
            }
            registration.active = false;
            registration.source.clone()
        };
        if let Some(source) = source {
            source.unregister(self.signum);
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.close(None);
    }
}

impl std::fmt::Debug for SignalWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWatcher")
            .field("signum", &self.signum)
            .finish_non_exhaustive()
    }
}

/// Latch the terminal error, unregister a still-active source, and fail
/// every waiter. Safe to run multiple times; only the first call has an
/// effect.
fn close_shared(
    scheduler: &Scheduler,
    shared: &Weak<Shared>,
    signum: i32,
    cause: Option<TaskError>,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let wakes = {
        let mut queue = shared.waiters.lock();
        if queue.is_closed() {
            return;
        }
        queue.close(TaskError::WatcherClosed {
            cause: cause.map(Box::new),
        })
    };
    let source = {
        let mut registration = shared.registration.lock();
        let active = std::mem::replace(&mut registration.active, false);
        let source = registration.source.take();
        if active {
            source
        } else {
            None
        }
    };
    if let Some(source) = source {
        source.unregister(signum);
    }
    for (task, outcome) in wakes {
        scheduler.wake(task, outcome);
    }
}

/// Build a fiber that waits for a single delivery on `watcher` and completes
/// with the delivered signal number.
pub fn await_signal_fiber(watcher: Arc<SignalWatcher>) -> Box<dyn Fiber> {
    struct AwaitSignal {
        watcher: Arc<SignalWatcher>,
    }

    impl Fiber for AwaitSignal {
        fn resume(&mut self, cx: &mut TaskContext, input: Resume) -> Result<Step, TaskError> {
            match input {
                Resume::Start => self.watcher.await_signal(cx.task_id()),
                Resume::Value(signum) => Ok(Step::Complete(signum)),
                Resume::Err(error) => Err(error),
            }
        }
    }

    Box::new(AwaitSignal { watcher })
}
