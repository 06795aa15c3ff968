//! Integration tests for the scheduler dispatch loop and task lifecycle.

use parking_lot::Mutex;
use std::sync::Arc;
use strand_core::{
    Context, FnFiber, Scheduler, SchedulerError, TaskError, TaskState, Value,
};

#[test]
fn test_tasks_run_in_submission_order() {
    let scheduler = Scheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5 {
        let order = order.clone();
        scheduler.spawn(move |_cx| {
            order.lock().push(i);
            Ok(Value::Null)
        });
    }

    scheduler.dispose();
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_spawned_task_runs_in_same_pass() {
    let scheduler = Scheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let outer_order = order.clone();
    scheduler.spawn(move |cx| {
        outer_order.lock().push("outer");
        let inner_order = outer_order.clone();
        cx.spawn(move |_cx| {
            inner_order.lock().push("inner");
            Ok(Value::Null)
        });
        Ok(Value::Null)
    });

    scheduler.dispose();
    assert_eq!(*order.lock(), vec!["outer", "inner"]);
}

#[test]
fn test_run_task_drains_other_submissions() {
    let scheduler = Scheduler::new();
    let side = scheduler.spawn(|_cx| Ok(Value::Int(1)));

    let result = scheduler.run_task(Box::new(FnFiber::new(|_cx| Ok(Value::Int(2)))));

    assert_eq!(result, Ok(Value::Int(2)));
    assert_eq!(side.result(), Some(Ok(Value::Int(1))));
}

#[test]
fn test_run_task_inside_fiber_is_rejected() {
    let scheduler = Scheduler::new();
    let result = scheduler.run_task(Box::new(FnFiber::new(|cx| {
        let nested = cx
            .scheduler()
            .run_task(Box::new(FnFiber::new(|_cx| Ok(Value::Null))));
        assert_eq!(nested, Err(SchedulerError::AlreadyRunning));
        Ok(Value::Null)
    })));
    assert_eq!(result, Ok(Value::Null));
}

#[test]
fn test_cancel_ready_task() {
    let scheduler = Scheduler::new();
    let keep = scheduler.spawn(|_cx| Ok(Value::Int(1)));
    let cancelled = scheduler.spawn(|_cx| Ok(Value::Int(2)));

    assert!(cancelled.cancel(TaskError::Cancelled));
    assert_eq!(cancelled.state(), Some(TaskState::Failed));
    // A terminal task cannot be cancelled again.
    assert!(!cancelled.cancel(TaskError::Cancelled));

    scheduler.dispose();
    assert_eq!(keep.result(), Some(Ok(Value::Int(1))));
    assert_eq!(cancelled.result(), Some(Err(TaskError::Cancelled)));
}

#[test]
fn test_dispose_runs_pending_work_and_is_idempotent() {
    let scheduler = Scheduler::new();
    let handle = scheduler.spawn(|_cx| Ok(Value::Int(3)));

    scheduler.dispose();
    assert_eq!(handle.result(), Some(Ok(Value::Int(3))));

    // A second dispose is a no-op.
    scheduler.dispose();
    assert_eq!(handle.result(), Some(Ok(Value::Int(3))));
}

#[test]
fn test_on_complete_fires_on_completion() {
    let scheduler = Scheduler::new();
    let seen = Arc::new(Mutex::new(None));

    let handle = scheduler.spawn(|_cx| Ok(Value::Str("done".into())));
    let seen_clone = seen.clone();
    handle.on_complete(move |_id, outcome| {
        *seen_clone.lock() = Some(outcome.clone());
    });
    assert!(seen.lock().is_none());

    scheduler.dispose();
    assert_eq!(*seen.lock(), Some(Ok(Value::Str("done".into()))));
}

#[test]
fn test_context_is_inherited_by_spawn() {
    let scheduler = Scheduler::new();
    let handle = scheduler.submit(
        Box::new(FnFiber::new(|cx| {
            assert!(cx.context().is_background());
            let child = cx.spawn(|cx| {
                assert!(cx.context().is_background());
                Ok(Value::Null)
            });
            let _ = child;
            Ok(Value::Null)
        })),
        Context::background(),
    );

    scheduler.dispose();
    assert_eq!(handle.result(), Some(Ok(Value::Null)));
}

#[test]
fn test_stats_track_lifecycle() {
    let scheduler = Scheduler::new();
    scheduler.spawn(|_cx| Ok(Value::Null));
    scheduler.spawn(|_cx| Err(TaskError::msg("boom")));
    let cancelled = scheduler.spawn(|_cx| Ok(Value::Null));
    cancelled.cancel(TaskError::Cancelled);

    scheduler.dispose();

    let stats = scheduler.stats();
    assert_eq!(stats.started, 2);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.failed, 2);
}

#[test]
#[should_panic(expected = "Cannot dispose a scheduler from inside its own dispatch loop")]
fn test_dispose_inside_dispatch_panics() {
    let scheduler = Scheduler::new();
    scheduler.spawn(|cx| {
        cx.scheduler().dispose();
        Ok(Value::Null)
    });
    scheduler.dispose();
}
