//! Index-based intrusive FIFO queues.
//!
//! Tasks and operation records live in arena maps keyed by their ids; queue
//! membership is expressed through [`Links`] embedded in each entry. This
//! keeps enqueue, dequeue, and detach-by-identity O(1) without entries being
//! owned by the queues themselves.

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// Queue linkage embedded in an arena entry.
#[derive(Debug, Clone, Copy)]
pub struct Links<I> {
    prev: Option<I>,
    next: Option<I>,
}

impl<I> Default for Links<I> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

/// Arena entries that carry queue linkage.
pub trait Linked<I> {
    /// Shared access to the entry's linkage.
    fn links(&self) -> &Links<I>;

    /// Mutable access to the entry's linkage.
    fn links_mut(&mut self) -> &mut Links<I>;
}

/// FIFO queue over entries stored in an arena map.
///
/// The queue only records ids; callers pass the arena into every operation.
/// An entry must be in at most one queue at a time, and `detach` may only be
/// called for an entry that is currently queued here.
#[derive(Debug)]
pub struct FifoQueue<I> {
    first: Option<I>,
    last: Option<I>,
    len: usize,
}

impl<I: Copy + Eq + Hash> FifoQueue<I> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
        }
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Id of the head entry, if any.
    pub fn first(&self) -> Option<I> {
        self.first
    }

    /// Id of the tail entry, if any.
    pub fn last(&self) -> Option<I> {
        self.last
    }

    /// Append an entry to the tail.
    pub fn push<N: Linked<I>>(&mut self, arena: &mut FxHashMap<I, N>, id: I) {
        {
            let entry = arena.get_mut(&id).expect("queued entry missing from arena");
            let links = entry.links_mut();
            links.prev = self.last;
            links.next = None;
        }
        match self.last {
            Some(last) => {
                arena
                    .get_mut(&last)
                    .expect("queue tail missing from arena")
                    .links_mut()
                    .next = Some(id);
            }
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.len += 1;
    }

    /// Remove and return the head entry.
    pub fn pop<N: Linked<I>>(&mut self, arena: &mut FxHashMap<I, N>) -> Option<I> {
        let id = self.first?;
        let next = {
            let entry = arena.get_mut(&id).expect("queue head missing from arena");
            let links = entry.links_mut();
            let next = links.next;
            links.prev = None;
            links.next = None;
            next
        };
        self.first = next;
        match next {
            Some(next) => {
                arena
                    .get_mut(&next)
                    .expect("queued entry missing from arena")
                    .links_mut()
                    .prev = None;
            }
            None => self.last = None,
        }
        self.len -= 1;
        Some(id)
    }

    /// Unlink an entry by identity, wherever it sits in the queue.
    ///
    /// Returns `false` if the entry is not present in the arena.
    pub fn detach<N: Linked<I>>(&mut self, arena: &mut FxHashMap<I, N>, id: I) -> bool {
        let links = match arena.get(&id) {
            Some(entry) => *entry.links(),
            None => return false,
        };
        if let Some(prev) = links.prev {
            arena
                .get_mut(&prev)
                .expect("queued entry missing from arena")
                .links_mut()
                .next = links.next;
        }
        if let Some(next) = links.next {
            arena
                .get_mut(&next)
                .expect("queued entry missing from arena")
                .links_mut()
                .prev = links.prev;
        }
        if self.first == Some(id) {
            self.first = links.next;
        }
        if self.last == Some(id) {
            self.last = links.prev;
        }
        let entry = arena.get_mut(&id).expect("queued entry missing from arena");
        *entry.links_mut() = Links::default();
        self.len -= 1;
        true
    }
}

impl<I: Copy + Eq + Hash> Default for FifoQueue<I> {
    fn default() -> Self {
        Self::new()
    }
}
