//! Ready queue and deadline list: the two arena-index lists the scheduler
//! consults on every decision (spec.md §4.1 "Tick handler" / "Deadline
//! policy"). Both are singly linked through fields already on the [`Tcb`]
//! slot, so membership changes never allocate.

use super::arena::{self, TaskIndex, MAX_PRIORITY};

const BUCKETS: usize = MAX_PRIORITY as usize + 1;

pub struct ReadyQueue {
    heads: [Option<TaskIndex>; BUCKETS],
    tails: [Option<TaskIndex>; BUCKETS],
}

impl ReadyQueue {
    pub const fn new() -> Self {
        ReadyQueue {
            heads: [None; BUCKETS],
            tails: [None; BUCKETS],
        }
    }

    /// Appends `task` to the tail of its priority bucket (FIFO within a
    /// priority level, per spec.md §4.1's round-robin tie-break).
    pub fn push_back(&mut self, task: TaskIndex, priority: u8) {
        let p = priority.min(MAX_PRIORITY) as usize;
        arena::with_mut(task, |t| t.ready_next = None);
        match self.tails[p] {
            Some(tail) => {
                arena::with_mut(tail, |t| t.ready_next = Some(task));
            }
            None => self.heads[p] = Some(task),
        }
        self.tails[p] = Some(task);
    }

    /// Highest-priority (numerically lowest) ready task, removed from the
    /// queue.
    pub fn pop_front(&mut self) -> Option<(TaskIndex, u8)> {
        for p in 0..BUCKETS {
            if let Some(head) = self.heads[p] {
                let next = arena::with(head, |t| t.ready_next).flatten();
                self.heads[p] = next;
                if next.is_none() {
                    self.tails[p] = None;
                }
                return Some((head, p as u8));
            }
        }
        None
    }

    /// Removes `task` from wherever it is currently linked, scanning only
    /// `priority`'s bucket. Used when a task blocks, exits, or is about to
    /// be reprioritized.
    pub fn remove(&mut self, task: TaskIndex, priority: u8) {
        let p = priority.min(MAX_PRIORITY) as usize;
        let mut cur = self.heads[p];
        let mut prev: Option<TaskIndex> = None;
        while let Some(c) = cur {
            let next = arena::with(c, |t| t.ready_next).flatten();
            if c.0 == task.0 {
                match prev {
                    Some(pv) => {
                        arena::with_mut(pv, |t| t.ready_next = next);
                    }
                    None => self.heads[p] = next,
                }
                if self.tails[p].map(|t| t.0) == Some(task.0) {
                    self.tails[p] = prev;
                }
                arena::with_mut(task, |t| t.ready_next = None);
                return;
            }
            prev = Some(c);
            cur = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(|h| h.is_none())
    }

    /// Priority of the task `pop_front` would return, without removing it.
    pub fn peek_front_priority(&self) -> Option<u8> {
        self.heads
            .iter()
            .position(|h| h.is_some())
            .map(|p| p as u8)
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorted earliest-deadline-first singly linked list threaded through
/// `Tcb::deadline_next`.
pub struct DeadlineList {
    head: Option<TaskIndex>,
}

impl DeadlineList {
    pub const fn new() -> Self {
        DeadlineList { head: None }
    }

    pub fn insert(&mut self, task: TaskIndex, deadline: u64) {
        self.remove(task);
        let mut cur = self.head;
        let mut prev: Option<TaskIndex> = None;
        while let Some(c) = cur {
            let cd = arena::with(c, |t| t.deadline).flatten();
            let stop = match cd {
                Some(d) => deadline < d,
                None => true,
            };
            if stop {
                break;
            }
            prev = Some(c);
            cur = arena::with(c, |t| t.deadline_next).flatten();
        }
        arena::with_mut(task, |t| t.deadline_next = cur);
        match prev {
            Some(p) => {
                arena::with_mut(p, |t| t.deadline_next = Some(task));
            }
            None => self.head = Some(task),
        }
    }

    pub fn remove(&mut self, task: TaskIndex) {
        let mut cur = self.head;
        let mut prev: Option<TaskIndex> = None;
        while let Some(c) = cur {
            let next = arena::with(c, |t| t.deadline_next).flatten();
            if c.0 == task.0 {
                match prev {
                    Some(p) => {
                        arena::with_mut(p, |t| t.deadline_next = next);
                    }
                    None => self.head = next,
                }
                arena::with_mut(task, |t| t.deadline_next = None);
                return;
            }
            prev = Some(c);
            cur = next;
        }
    }

    /// Iterates the list earliest-first. Used by the tick handler's deadline
    /// walk; callers must not mutate list membership from within `f` for the
    /// current node (they may requeue it elsewhere afterward).
    pub fn for_each(&self, mut f: impl FnMut(TaskIndex)) {
        let mut cur = self.head;
        while let Some(c) = cur {
            let next = arena::with(c, |t| t.deadline_next).flatten();
            f(c);
            cur = next;
        }
    }
}

impl Default for DeadlineList {
    fn default() -> Self {
        Self::new()
    }
}
