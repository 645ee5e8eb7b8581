//! Fixed-capacity task arena (spec.md §9 "pointer-heavy intrusive lists →
//! ownership-safe alternatives"). Every task lives in a slot of a static
//! array and is addressed by a 16-bit [`TaskIndex`]; the ready queue,
//! deadline list, and waiter lists are just `Option<TaskIndex>` fields on
//! the slot, so there is exactly one owner of each task's memory and no
//! raw pointer aliases it.

use super::ctx::Context;

pub const MAX_TASKS: usize = 256;
pub const MAX_PRIORITY: u8 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct TaskIndex(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

pub struct Tcb {
    pub name: [u8; 16],
    pub name_len: u8,
    pub state: TaskState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub deadline: Option<u64>,
    pub quantum: u8,
    pub ctx: Context,
    pub stack_base: u64,
    pub stack_pages: usize,

    // Ready-queue membership (singly linked, one bucket per priority).
    pub ready_next: Option<TaskIndex>,

    // Deadline list membership (singly linked, sorted earliest-first).
    pub deadline_next: Option<TaskIndex>,

    // Priority-inheritance bookkeeping: what this task is blocked on, the
    // list of tasks blocked on *this* task (if it holds a resource), and
    // this task's own link in its holder's waiter list.
    pub blocked_on: Option<TaskIndex>,
    pub waiters_head: Option<TaskIndex>,
    pub waiter_next: Option<TaskIndex>,

    pub switches_voluntary: u64,
    pub switches_involuntary: u64,
    pub inversions: u64,
}

impl Tcb {
    const fn empty() -> Self {
        Tcb {
            name: [0u8; 16],
            name_len: 0,
            state: TaskState::Dead,
            base_priority: MAX_PRIORITY,
            effective_priority: MAX_PRIORITY,
            deadline: None,
            quantum: 0,
            ctx: Context::zero(),
            stack_base: 0,
            stack_pages: 0,
            ready_next: None,
            deadline_next: None,
            blocked_on: None,
            waiters_head: None,
            waiter_next: None,
            switches_voluntary: 0,
            switches_involuntary: 0,
            inversions: 0,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(self.name.len());
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name_len = n as u8;
    }

    pub fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

struct Arena {
    slots: [Tcb; MAX_TASKS],
    live: [bool; MAX_TASKS],
    free_stack: [u16; MAX_TASKS],
    free_len: usize,
}

impl Arena {
    const fn new() -> Self {
        let mut free_stack = [0u16; MAX_TASKS];
        let mut i = 0;
        while i < MAX_TASKS {
            free_stack[i] = (MAX_TASKS - 1 - i) as u16;
            i += 1;
        }
        Arena {
            slots: [const { Tcb::empty() }; MAX_TASKS],
            live: [false; MAX_TASKS],
            free_stack,
            free_len: MAX_TASKS,
        }
    }
}

static ARENA: spin::Mutex<Arena> = spin::Mutex::new(Arena::new());

/// Reserves a slot, returning `None` if the pool is exhausted (spec.md §4.1
/// "fails if the fixed-size task pool is exhausted").
pub fn alloc_slot() -> Option<TaskIndex> {
    let mut a = ARENA.lock();
    if a.free_len == 0 {
        return None;
    }
    a.free_len -= 1;
    let idx = a.free_stack[a.free_len];
    a.live[idx as usize] = true;
    Some(TaskIndex(idx))
}

/// Marks a slot dead and reusable. Per spec.md §4.1 "dead slots may be
/// re-created in place" — the slot is not scrubbed until the next
/// `alloc_slot` overwrites it via `with_mut`.
pub fn free_slot(idx: TaskIndex) {
    let mut a = ARENA.lock();
    if !a.live[idx.0 as usize] {
        return;
    }
    a.live[idx.0 as usize] = false;
    a.slots[idx.0 as usize] = Tcb::empty();
    a.free_stack[a.free_len] = idx.0;
    a.free_len += 1;
}

pub fn with<R>(idx: TaskIndex, f: impl FnOnce(&Tcb) -> R) -> Option<R> {
    let a = ARENA.lock();
    if !a.live[idx.0 as usize] {
        return None;
    }
    Some(f(&a.slots[idx.0 as usize]))
}

pub fn with_mut<R>(idx: TaskIndex, f: impl FnOnce(&mut Tcb) -> R) -> Option<R> {
    let mut a = ARENA.lock();
    if !a.live[idx.0 as usize] {
        return None;
    }
    Some(f(&mut a.slots[idx.0 as usize]))
}

/// Grants access to two distinct live slots at once, needed by the context
/// switch (save into the outgoing task, load from the incoming one) and by
/// priority inheritance (adjust both waiter and holder).
pub fn with_two_mut<R>(
    a_idx: TaskIndex,
    b_idx: TaskIndex,
    f: impl FnOnce(&mut Tcb, &mut Tcb) -> R,
) -> Option<R> {
    if a_idx.0 == b_idx.0 {
        return None;
    }
    let mut arena = ARENA.lock();
    if !arena.live[a_idx.0 as usize] || !arena.live[b_idx.0 as usize] {
        return None;
    }
    let (lo, hi) = if a_idx.0 < b_idx.0 {
        (a_idx.0 as usize, b_idx.0 as usize)
    } else {
        (b_idx.0 as usize, a_idx.0 as usize)
    };
    let (left, right) = arena.slots.split_at_mut(hi);
    let (first, second) = (&mut left[lo], &mut right[0]);
    if a_idx.0 < b_idx.0 {
        Some(f(first, second))
    } else {
        Some(f(second, first))
    }
}

pub fn is_live(idx: TaskIndex) -> bool {
    ARENA.lock().live[idx.0 as usize]
}

/// Force-unlocks `ARENA` without having held a guard. Needed exactly once:
/// a freshly created task resumes inside the context switch that first
/// scheduled it, which took this lock on the task's behalf via
/// [`with_two_mut`] but has no stack frame left to drop it from (see
/// `sched::release_fresh_task_locks`).
///
/// # Safety
/// Must only be called when no `with`/`with_mut`/`with_two_mut` call is
/// genuinely in progress on this CPU.
pub(crate) unsafe fn force_unlock() {
    ARENA.force_unlock();
}
