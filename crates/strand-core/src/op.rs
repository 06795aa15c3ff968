//! Operation wait-queues: the awaitable primitive.
//!
//! Every suspension point (signals, timers, I/O readiness) is built from an
//! [`OpQueue`]: a FIFO of pending operation records, each owned by one
//! suspended task. Resolving a record produces a wake entry that the owning
//! resource feeds back to its scheduler via [`Scheduler::wake`]; the queue
//! itself holds no scheduler reference, which keeps it independently testable
//! and makes lock ordering trivial for resources.
//!
//! [`Scheduler::wake`]: crate::scheduler::Scheduler::wake

use crate::list::{FifoQueue, Linked, Links};
use crate::task::TaskId;
use crate::value::Value;
use crate::{TaskError, TaskOutcome};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a pending operation record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OpId(u64);

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

impl OpId {
    fn new() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A single pending suspension request.
#[derive(Debug)]
struct OpRecord {
    task: TaskId,
    links: Links<OpId>,
}

impl Linked<OpId> for OpRecord {
    fn links(&self) -> &Links<OpId> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<OpId> {
        &mut self.links
    }
}

/// Wake instruction produced by resolving an operation record.
pub type Wake = (TaskId, TaskOutcome);

/// FIFO wait queue of pending operations belonging to one resource.
#[derive(Debug, Default)]
pub struct OpQueue {
    ops: FxHashMap<OpId, OpRecord>,
    queue: FifoQueue<OpId>,
    error: Option<TaskError>,
}

impl OpQueue {
    /// Create an empty wait queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check whether no records are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The latched terminal error, if the queue has been closed.
    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Check whether the terminal error has been latched.
    pub fn is_closed(&self) -> bool {
        self.error.is_some()
    }

    /// Append a record for `task`. O(1).
    ///
    /// Once the queue is closed the record is never queued; the latched error
    /// is returned immediately instead.
    pub fn enqueue(&mut self, task: TaskId) -> Result<OpId, TaskError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let id = OpId::new();
        self.ops.insert(
            id,
            OpRecord {
                task,
                links: Links::default(),
            },
        );
        self.queue.push(&mut self.ops, id);
        Ok(id)
    }

    /// Resolve one record with a value, unlinking it.
    ///
    /// Returns `None` if the record is no longer queued (already resolved or
    /// cancelled); resolution is idempotent.
    pub fn finish(&mut self, op: OpId, value: Value) -> Option<Wake> {
        self.resolve(op, Ok(value))
    }

    /// Resolve one record with an error, unlinking it.
    pub fn fail(&mut self, op: OpId, error: TaskError) -> Option<Wake> {
        self.resolve(op, Err(error))
    }

    fn resolve(&mut self, op: OpId, outcome: TaskOutcome) -> Option<Wake> {
        if !self.ops.contains_key(&op) {
            return None;
        }
        self.queue.detach(&mut self.ops, op);
        let record = self.ops.remove(&op).expect("operation record vanished");
        Some((record.task, outcome))
    }

    /// Unlink a record without waking its owner. O(1), idempotent.
    pub fn cancel(&mut self, op: OpId) -> bool {
        if !self.ops.contains_key(&op) {
            return false;
        }
        self.queue.detach(&mut self.ops, op);
        self.ops.remove(&op);
        true
    }

    /// Resolve every record present at call time with `value`, in enqueue
    /// order.
    ///
    /// The current tail acts as a fence: records enqueued while the produced
    /// wakes are being delivered wait for the next event, so a waiter that
    /// re-registers on resolution cannot spin the drain forever.
    pub fn broadcast(&mut self, value: Value) -> Vec<Wake> {
        let fence = self.queue.last();
        let mut wakes = Vec::with_capacity(self.queue.len());
        while let Some(id) = self.queue.pop(&mut self.ops) {
            let record = self.ops.remove(&id).expect("operation record vanished");
            wakes.push((record.task, Ok(value.clone())));
            if Some(id) == fence {
                break;
            }
        }
        wakes
    }

    /// Latch the terminal error and fail every pending record with it.
    ///
    /// The first close wins; later calls return no wakes and leave the
    /// original error in place. After closing, every future `enqueue` is
    /// rejected with the latched error.
    pub fn close(&mut self, error: TaskError) -> Vec<Wake> {
        if self.error.is_some() {
            return Vec::new();
        }
        self.error = Some(error.clone());
        let mut wakes = Vec::with_capacity(self.queue.len());
        while let Some(id) = self.queue.pop(&mut self.ops) {
            let record = self.ops.remove(&id).expect("operation record vanished");
            wakes.push((record.task, Err(error.clone())));
        }
        wakes
    }
}
