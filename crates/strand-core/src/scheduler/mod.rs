//! Task scheduler: ready/suspended queues, the dispatch loop, run/stop
//! protocol, and the thread-local scheduler stack.

#[allow(clippy::module_inception)]
mod scheduler;
pub mod stack;

pub use scheduler::{Scheduler, SchedulerStats, ShutdownId};
