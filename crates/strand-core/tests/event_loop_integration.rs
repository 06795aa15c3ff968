//! Integration tests for host event-loop embedding: the activate protocol,
//! dispatch interleaving, keep-alive bookkeeping, and stop/dispose behavior.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use strand_core::{
    Context, EventLoop, Fiber, OpQueue, Resume, Scheduler, SchedulerError, Step, TaskContext,
    TaskError, TaskId, TaskState, Value,
};

type Job = Box<dyn FnOnce() + Send>;

/// Minimal host loop: alternates dispatch passes with queued external jobs
/// (the stand-in for I/O and timer events) until both run dry or the loop is
/// stopped.
#[derive(Default)]
struct TestLoop {
    activations: AtomicUsize,
    fail_activate: AtomicBool,
    stopped: AtomicBool,
    jobs: Mutex<VecDeque<Job>>,
}

impl TestLoop {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_job(&self, job: impl FnOnce() + Send + 'static) {
        self.jobs.lock().push_back(Box::new(job));
    }

    fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }
}

impl EventLoop for TestLoop {
    fn activate(&self, _scheduler: &Scheduler) -> Result<(), TaskError> {
        if self.fail_activate.load(Ordering::SeqCst) {
            return Err(TaskError::msg("wakeup failed"));
        }
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run_loop(&self, scheduler: &Scheduler) -> Result<(), TaskError> {
        while !self.stopped.load(Ordering::SeqCst) {
            scheduler
                .dispatch()
                .map_err(|error| TaskError::msg(error.to_string()))?;
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(),
                None if scheduler.ready_len() > 0 => {}
                None => break,
            }
        }
        Ok(())
    }

    fn stop_loop(&self, _scheduler: &Scheduler) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// An awaitable gate built on the operation wait-queue, opened by test jobs.
struct Gate {
    scheduler: Scheduler,
    queue: Mutex<OpQueue>,
}

impl Gate {
    fn new(scheduler: &Scheduler) -> Arc<Self> {
        Arc::new(Self {
            scheduler: scheduler.clone(),
            queue: Mutex::new(OpQueue::new()),
        })
    }

    fn wait(&self, task: TaskId) -> Result<Step, TaskError> {
        self.queue.lock().enqueue(task)?;
        Ok(Step::Suspend)
    }

    fn open(&self, value: Value) -> usize {
        let wakes = self.queue.lock().broadcast(value);
        let woken = wakes.len();
        for (task, outcome) in wakes {
            self.scheduler.wake(task, outcome);
        }
        woken
    }
}

/// Waits on a gate once and completes with the delivered value.
struct WaitFiber {
    gate: Arc<Gate>,
}

impl Fiber for WaitFiber {
    fn resume(&mut self, cx: &mut TaskContext, input: Resume) -> Result<Step, TaskError> {
        match input {
            Resume::Start => self.gate.wait(cx.task_id()),
            Resume::Value(value) => Ok(Step::Complete(value)),
            Resume::Err(error) => Err(error),
        }
    }
}

#[test]
fn test_run_dispatches_through_host_loop() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver.clone());
    assert!(scheduler.has_event_loop());

    let handle = scheduler.spawn(|_cx| Ok(Value::Int(1)));
    assert_eq!(driver.activations(), 1);

    scheduler.dispose();
    assert_eq!(handle.result(), Some(Ok(Value::Int(1))));
}

#[test]
fn test_activate_fires_once_per_idle_transition() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver.clone());

    scheduler.spawn(|_cx| Ok(Value::Null));
    scheduler.spawn(|_cx| Ok(Value::Null));
    // Only the transition from an idle queue notifies the loop.
    assert_eq!(driver.activations(), 1);

    scheduler.dispose();
    assert_eq!(driver.activations(), 1);
}

#[test]
fn test_suspend_and_wake_across_loop_iterations() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver.clone());
    let gate = Gate::new(&scheduler);

    let handle = scheduler.submit(
        Box::new(WaitFiber { gate: gate.clone() }),
        Context::default(),
    );

    let scheduler_in_job = scheduler.clone();
    let gate_in_job = gate.clone();
    driver.push_job(move || {
        // The suspended wait holds the loop open.
        assert_eq!(scheduler_in_job.keep_alive(), 1);
        assert_eq!(scheduler_in_job.suspended_len(), 1);
        assert_eq!(gate_in_job.open(Value::Int(7)), 1);
        assert_eq!(scheduler_in_job.keep_alive(), 0);
    });

    scheduler.dispose();

    assert_eq!(handle.result(), Some(Ok(Value::Int(7))));
    // Start activation plus the wake-up re-activation.
    assert_eq!(driver.activations(), 2);
    assert_eq!(scheduler.stats().resumed, 1);
}

#[test]
fn test_background_wait_does_not_keep_loop_alive() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver.clone());
    let gate = Gate::new(&scheduler);

    let handle = scheduler.submit(
        Box::new(WaitFiber { gate: gate.clone() }),
        Context::background(),
    );

    let scheduler_in_job = scheduler.clone();
    let gate_in_job = gate.clone();
    driver.push_job(move || {
        assert_eq!(scheduler_in_job.suspended_len(), 1);
        assert_eq!(scheduler_in_job.keep_alive(), 0);
        gate_in_job.open(Value::Null);
    });

    scheduler.dispose();
    assert_eq!(handle.result(), Some(Ok(Value::Null)));
}

#[test]
fn test_activate_failure_rolls_back_submission() {
    let driver = TestLoop::new();
    driver.fail_activate.store(true, Ordering::SeqCst);
    let scheduler = Scheduler::with_event_loop(driver.clone());

    let handle = scheduler.spawn(|_cx| Ok(Value::Null));

    // The task never reached the ready queue.
    assert_eq!(scheduler.ready_len(), 0);
    assert_eq!(handle.state(), Some(TaskState::Failed));
    assert_eq!(handle.result(), Some(Err(TaskError::msg("wakeup failed"))));
    assert_eq!(driver.activations(), 0);
}

#[test]
fn test_dispatch_requires_active_run() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver);
    assert_eq!(scheduler.dispatch(), Err(SchedulerError::NotRunning));
}

#[test]
fn test_dispatch_inside_activate_is_rejected() {
    /// Loop whose activate hook illegally dispatches instead of scheduling.
    struct ReentrantLoop {
        inner: Arc<TestLoop>,
        activate_error: Mutex<Option<SchedulerError>>,
    }

    impl EventLoop for ReentrantLoop {
        fn activate(&self, scheduler: &Scheduler) -> Result<(), TaskError> {
            if let Err(error) = scheduler.dispatch() {
                *self.activate_error.lock() = Some(error);
            }
            Ok(())
        }

        fn run_loop(&self, scheduler: &Scheduler) -> Result<(), TaskError> {
            self.inner.run_loop(scheduler)
        }

        fn stop_loop(&self, scheduler: &Scheduler) {
            self.inner.stop_loop(scheduler)
        }
    }

    let driver = Arc::new(ReentrantLoop {
        inner: TestLoop::new(),
        activate_error: Mutex::new(None),
    });
    let scheduler = Scheduler::with_event_loop(driver.clone());
    let gate = Gate::new(&scheduler);

    let handle = scheduler.submit(
        Box::new(WaitFiber { gate: gate.clone() }),
        Context::default(),
    );
    // Before the run starts the hook sees a scheduler that is not running.
    assert_eq!(
        driver.activate_error.lock().take(),
        Some(SchedulerError::NotRunning)
    );

    let gate_in_job = gate.clone();
    driver.inner.push_job(move || {
        // Waking mid-run re-activates; dispatching from the hook is refused.
        gate_in_job.open(Value::Int(1));
    });

    scheduler.dispose();
    assert_eq!(
        driver.activate_error.lock().take(),
        Some(SchedulerError::DispatchInActivate)
    );
    assert_eq!(handle.result(), Some(Ok(Value::Int(1))));
}

#[test]
fn test_stop_unwinds_run_and_dispose_fails_waiters() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver.clone());
    let gate = Gate::new(&scheduler);

    let handle = scheduler.submit(
        Box::new(WaitFiber { gate: gate.clone() }),
        Context::default(),
    );

    let scheduler_in_job = scheduler.clone();
    driver.push_job(move || {
        scheduler_in_job.stop();
    });

    scheduler.dispose();

    // The wait never resolved; shutdown failed it without resuming the fiber.
    assert_eq!(handle.result(), Some(Err(TaskError::SchedulerShutdown)));
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.keep_alive(), 0);
}

#[test]
#[should_panic(expected = "Cannot stop scheduler loop that is not running")]
fn test_stop_outside_run_panics() {
    let driver = TestLoop::new();
    let scheduler = Scheduler::with_event_loop(driver);
    scheduler.stop();
}
