//! Thread-local scheduler stack.
//!
//! Each thread owns a stack of schedulers plus a lazily created default.
//! [`current`] resolves, in order: the scheduler whose dispatch loop or run
//! is executing on this thread, the top of the explicitly pushed stack, and
//! finally the thread default. Pushing lets embedders nest an inner
//! scheduler (a blocking sub-loop) over an outer one and restore the outer
//! afterwards.

use crate::scheduler::Scheduler;
use crate::{SchedulerError, SchedulerResult};
use std::cell::RefCell;

thread_local! {
    /// Schedulers made current by an in-progress run or dispatch.
    static ACTIVE: RefCell<Vec<Scheduler>> = const { RefCell::new(Vec::new()) };
    /// Schedulers pushed explicitly by the embedder.
    static STACK: RefCell<Vec<Scheduler>> = const { RefCell::new(Vec::new()) };
    /// Created on first use when nothing else is current.
    static DEFAULT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// RAII marker that makes a scheduler current for the enclosing scope.
///
/// Created by the scheduler around its run, dispatch, and dispose entry
/// points; dropping it restores the previously current scheduler.
pub(crate) struct CurrentGuard {
    _private: (),
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

/// Make `scheduler` current until the returned guard is dropped.
pub(crate) fn enter(scheduler: Scheduler) -> CurrentGuard {
    ACTIVE.with(|active| active.borrow_mut().push(scheduler));
    CurrentGuard { _private: () }
}

/// The scheduler new work on this thread is submitted to.
///
/// Creates the thread default on first use when no scheduler is active or
/// pushed.
pub fn current() -> Scheduler {
    if let Some(scheduler) = ACTIVE.with(|active| active.borrow().last().cloned()) {
        return scheduler;
    }
    if let Some(scheduler) = STACK.with(|stack| stack.borrow().last().cloned()) {
        return scheduler;
    }
    DEFAULT.with(|default| {
        default
            .borrow_mut()
            .get_or_insert_with(Scheduler::new)
            .clone()
    })
}

/// Push `scheduler`, making it current for subsequent submissions.
pub fn push(scheduler: Scheduler) {
    STACK.with(|stack| stack.borrow_mut().push(scheduler));
}

/// Pop `scheduler` off the stack, restoring the previous one.
///
/// The popped scheduler is disposed: its pending tasks run or fail with the
/// shutdown error rather than leaking in an unreachable queue.
///
/// Usage errors: the stack is empty, or `scheduler` is not the top entry.
pub fn pop(scheduler: &Scheduler) -> SchedulerResult<()> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let Some(top) = stack.last() else {
            return Err(SchedulerError::StackEmpty);
        };
        if !top.same(scheduler) {
            return Err(SchedulerError::NotStackTop);
        }
        stack.pop();
        Ok(())
    })?;
    scheduler.mark_modified();
    scheduler.dispose();
    Ok(())
}

/// Tear down every scheduler this thread still holds.
///
/// Unwinds the pushed stack from the top, disposing each scheduler in turn,
/// then disposes the thread default if one was ever created. Embedders call
/// this when tearing a thread down so pending tasks are drained rather than
/// leaked.
pub fn shutdown() {
    while let Some(scheduler) = STACK.with(|stack| stack.borrow_mut().pop()) {
        scheduler.mark_modified();
        scheduler.dispose();
    }
    let default = DEFAULT.with(|default| default.borrow_mut().take());
    if let Some(scheduler) = default {
        scheduler.dispose();
    }
}
