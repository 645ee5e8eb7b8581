//! Priority inheritance protocol (spec.md §4.1 "Priority inheritance
//! protocol"). Lower numeric value is higher priority throughout this
//! module, matching the 0–31 scale the rest of the scheduler uses.

use super::arena::{self, TaskIndex, TaskState};
use super::queue::ReadyQueue;

static INVERSIONS: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

pub fn inversion_count() -> u64 {
    INVERSIONS.load(core::sync::atomic::Ordering::Relaxed)
}

/// `waiter` blocks on a resource held by `holder`. Links the waiter into
/// the holder's waiter list and boosts the holder if the waiter outranks
/// it.
pub fn add_waiter(rq: &mut ReadyQueue, holder: TaskIndex, waiter: TaskIndex) {
    arena::with_mut(waiter, |w| {
        w.blocked_on = Some(holder);
        w.state = TaskState::Blocked;
    });

    let waiter_prio = arena::with(waiter, |w| w.effective_priority).unwrap_or(u8::MAX);

    arena::with_mut(holder, |h| {
        let mut next = h.waiters_head;
        // Avoid double-linking if called twice for the same pair.
        while let Some(n) = next {
            if n.0 == waiter.0 {
                return;
            }
            next = arena::with(n, |t| t.waiter_next).flatten();
        }
    });
    arena::with_mut(waiter, |w| {
        let old_head = arena::with(holder, |h| h.waiters_head).flatten();
        w.waiter_next = old_head;
    });
    arena::with_mut(holder, |h| h.waiters_head = Some(waiter));

    let holder_prio = arena::with(holder, |h| h.effective_priority).unwrap_or(0);
    if waiter_prio < holder_prio {
        INVERSIONS.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let was_ready = arena::with(holder, |h| h.state == TaskState::Ready).unwrap_or(false);
        if was_ready {
            rq.remove(holder, holder_prio);
        }
        arena::with_mut(holder, |h| h.effective_priority = waiter_prio);
        if was_ready {
            rq.push_back(holder, waiter_prio);
        }
    }
}

/// `holder` releases the resource `waiter` was blocked on. Unlinks `waiter`
/// and restores `holder`'s effective priority to the best (numerically
/// lowest) of its base priority and any remaining waiters.
pub fn remove_waiter(rq: &mut ReadyQueue, holder: TaskIndex, waiter: TaskIndex) {
    arena::with_mut(holder, |h| {
        let mut cur = h.waiters_head;
        let mut prev: Option<TaskIndex> = None;
        while let Some(c) = cur {
            let next = arena::with(c, |t| t.waiter_next).flatten();
            if c.0 == waiter.0 {
                match prev {
                    Some(p) => {
                        arena::with_mut(p, |t| t.waiter_next = next);
                    }
                    None => h.waiters_head = next,
                }
                break;
            }
            prev = Some(c);
            cur = next;
        }
    });
    arena::with_mut(waiter, |w| {
        w.blocked_on = None;
        w.waiter_next = None;
    });

    let base = arena::with(holder, |h| h.base_priority).unwrap_or(super::arena::MAX_PRIORITY);
    let mut best = base;
    arena::with(holder, |h| h.waiters_head).flatten().map(|first| {
        let mut cur = Some(first);
        while let Some(c) = cur {
            let p = arena::with(c, |t| t.effective_priority).unwrap_or(base);
            if p < best {
                best = p;
            }
            cur = arena::with(c, |t| t.waiter_next).flatten();
        }
    });

    let old_prio = arena::with(holder, |h| h.effective_priority).unwrap_or(base);
    if old_prio != best {
        let was_ready = arena::with(holder, |h| h.state == TaskState::Ready).unwrap_or(false);
        if was_ready {
            rq.remove(holder, old_prio);
        }
        arena::with_mut(holder, |h| h.effective_priority = best);
        if was_ready {
            rq.push_back(holder, best);
        }
    }
}
