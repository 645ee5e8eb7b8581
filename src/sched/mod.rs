//! Preemptive, priority-based, deadline-aware scheduler (spec.md §4.1).
//!
//! Brought up after the memory subsystem (task stacks are physical pages)
//! and before virtio (virtio's completion waiters run as tasks). State is
//! one `Mutex<SchedState>` rather than the teacher's scattered statics —
//! per spec.md §9 "module-level globals... replace with process-wide state
//! explicitly constructed during `kernel_init`".

pub mod arena;
mod ctx;
mod pip;
mod queue;
pub mod task;

use snafu::Snafu;
use spin::Mutex;

use arena::{TaskIndex, TaskState, MAX_PRIORITY, MAX_TASKS};
use ctx::{Context, EntryFn};
use queue::{DeadlineList, ReadyQueue};

use crate::memory::layout::{KSTACK_SIZE, PAGE_SIZE};
use crate::memory::phys;

#[derive(Debug, Snafu)]
pub enum SchedError {
    #[snafu(display("scheduler not initialized"))]
    NotInitialized,
    #[snafu(display("task pool exhausted"))]
    PoolExhausted,
    #[snafu(display("stack allocation failed"))]
    StackAllocFailed,
    #[snafu(display("no such task"))]
    NoSuchTask,
    #[snafu(display("preemption enabled without a matching disable"))]
    UnbalancedEnable,
}

/// A task that has exited but whose stack and arena slot are not yet safe
/// to reclaim, because it was still executing on that stack when it was
/// recorded here. Reaped by the next task to make a scheduling decision
/// (see [`reap_zombie`]), which by construction is never this task.
struct Zombie {
    idx: TaskIndex,
    stack_base: u64,
    stack_pages: usize,
}

struct SchedState {
    ready: ReadyQueue,
    deadlines: DeadlineList,
    current: Option<TaskIndex>,
    idle: Option<TaskIndex>,
    preempt_depth: u32,
    pending_resched: bool,
    ticks: u64,
    zombie: Option<Zombie>,
}

static STATE: Mutex<SchedState> = Mutex::new(SchedState {
    ready: ReadyQueue::new(),
    deadlines: DeadlineList::new(),
    current: None,
    idle: None,
    preempt_depth: 0,
    pending_resched: false,
    ticks: 0,
    zombie: None,
});

static INITIALIZED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

const DEFAULT_QUANTUM: u8 = 10; // ticks, spec.md §4.1
const DEADLINE_BOOST_WINDOW: u64 = 10; // ticks

pub fn init() {
    if INITIALIZED.swap(true, core::sync::atomic::Ordering::SeqCst) {
        return;
    }
    let idle = spawn_internal("idle", idle_entry, 0, MAX_PRIORITY)
        .expect("idle task must always fit in a fresh pool");
    arena::with_mut(idle, |t| t.state = TaskState::Running);
    let mut s = STATE.lock();
    s.idle = Some(idle);
    s.current = Some(idle);
}

/// Releases the scheduler locks a freshly created task inherits from the
/// context switch that first resumes it (see `ctx::task_start`).
///
/// # Safety
/// Must only be called once, from `task_start`, before a brand-new task
/// touches anything that locks `STATE` or the task arena.
pub(crate) unsafe fn release_fresh_task_locks() {
    arena::force_unlock();
    STATE.force_unlock();
}

extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        unsafe { core::arch::asm!("sti; hlt", options(nomem, nostack)) };
    }
}

fn alloc_stack() -> Option<(u64, usize)> {
    let pages = KSTACK_SIZE.div_ceil(PAGE_SIZE).max(2);
    let frame = phys::alloc_contig(pages)?;
    Some((frame.addr(), pages))
}

fn spawn_internal(
    name: &str,
    entry: EntryFn,
    arg: usize,
    priority: u8,
) -> Result<TaskIndex, SchedError> {
    reap_zombie(&mut STATE.lock());
    let idx = arena::alloc_slot().ok_or(SchedError::PoolExhausted)?;
    let (stack_base, pages) = match alloc_stack() {
        Some(s) => s,
        None => {
            arena::free_slot(idx);
            return Err(SchedError::StackAllocFailed);
        }
    };
    let stack_top = stack_base + (pages * PAGE_SIZE) as u64;
    let prio = priority.min(MAX_PRIORITY);
    arena::with_mut(idx, |t| {
        t.set_name(name);
        t.base_priority = prio;
        t.effective_priority = prio;
        t.quantum = DEFAULT_QUANTUM;
        t.stack_base = stack_base;
        t.stack_pages = pages;
        t.state = TaskState::Ready;
        ctx::init_context(&mut t.ctx, stack_top, entry, arg, task_exit_trampoline);
    });
    Ok(idx)
}

/// Creates a task (spec.md §4.1 "Create task"). Priorities above 31 are
/// clamped, not rejected.
pub fn create_task(
    name: &str,
    entry: EntryFn,
    arg: usize,
    priority: u8,
) -> Result<TaskIndex, SchedError> {
    if !INITIALIZED.load(core::sync::atomic::Ordering::Relaxed) {
        return Err(SchedError::NotInitialized);
    }
    let idx = spawn_internal(name, entry, arg, priority)?;
    let prio = arena::with(idx, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
    STATE.lock().ready.push_back(idx, prio);
    Ok(idx)
}

extern "C" fn task_exit_trampoline() -> ! {
    exit_current()
}

/// Tears down the current task and switches to whatever runs next. Never
/// returns.
///
/// The exiting task's stack and arena slot cannot be freed here: `cur` is
/// still executing on that stack until `switch_locked` jumps away, and
/// `switch_locked` never returns into this frame once it does (spec.md
/// §4.1 "slot reusable"; §9 "dead slots may be re-created in place"). They
/// are registered as [`Zombie`] instead and reaped by whichever task makes
/// the *next* scheduling decision, which is never `cur`.
pub fn exit_current() -> ! {
    let mut s = STATE.lock();
    let cur = s.current.expect("scheduler running");
    arena::with_mut(cur, |t| t.state = TaskState::Dead);
    s.deadlines.remove(cur);
    let (stack_base, stack_pages) =
        arena::with(cur, |t| (t.stack_base, t.stack_pages)).unwrap_or((0, 0));
    let (next, _prio) = pick_next_locked(&mut s);
    s.zombie = Some(Zombie { idx: cur, stack_base, stack_pages });
    switch_locked(&mut s, cur, next);
    unreachable!("dead task resumed")
}

/// Frees the previous exit's stack and arena slot, if one is pending.
/// Always safe to call here: by the time anything reaches `pick_next_locked`
/// again, the zombie's own task has long since switched away and will never
/// run again.
fn reap_zombie(s: &mut SchedState) {
    if let Some(z) = s.zombie.take() {
        if z.stack_pages > 0 {
            phys::free_contig(phys::Frame(z.stack_base), z.stack_pages);
        }
        arena::free_slot(z.idx);
    }
}

fn pick_next_locked(s: &mut SchedState) -> (TaskIndex, u8) {
    reap_zombie(s);
    walk_deadlines(s);
    s.ready
        .pop_front()
        .unwrap_or_else(|| (s.idle.expect("idle exists"), MAX_PRIORITY))
}

/// Deadline policy (spec.md §4.1): walk earliest-first; past-due tasks are
/// logged once and cleared, near-due tasks are boosted to priority 0.
fn walk_deadlines(s: &mut SchedState) {
    let now = s.ticks;
    let mut boosts: arrayvec::ArrayVec<TaskIndex, MAX_TASKS> = arrayvec::ArrayVec::new();
    let mut misses: arrayvec::ArrayVec<TaskIndex, MAX_TASKS> = arrayvec::ArrayVec::new();
    s.deadlines.for_each(|idx| {
        let Some(deadline) = arena::with(idx, |t| t.deadline).flatten() else {
            return;
        };
        if deadline <= now {
            let _ = misses.try_push(idx);
        } else if deadline.saturating_sub(now) <= DEADLINE_BOOST_WINDOW {
            let _ = boosts.try_push(idx);
        }
    });
    for idx in misses {
        s.deadlines.remove(idx);
        arena::with_mut(idx, |t| t.deadline = None);
        if let Some(l) = crate::log::logger::try_get_logger() {
            l.log("[SCHED] deadline miss");
        }
    }
    for idx in boosts {
        s.deadlines.remove(idx);
        let was_ready = arena::with(idx, |t| t.state == TaskState::Ready).unwrap_or(false);
        let old_prio = arena::with(idx, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
        if was_ready && old_prio != 0 {
            s.ready.remove(idx, old_prio);
            s.ready.push_back(idx, 0);
        }
        arena::with_mut(idx, |t| t.effective_priority = 0);
    }
}

/// Performs the actual register save/restore, with `STATE`'s lock already
/// held for the surrounding bookkeeping — the switch itself touches no
/// locks, just a register save and an asm jump.
fn switch_locked(s: &mut SchedState, from: TaskIndex, to: TaskIndex) {
    if from.0 == to.0 {
        return;
    }
    s.current = Some(to);
    arena::with_mut(to, |t| t.state = TaskState::Running);
    let done = arena::with_two_mut(from, to, |f, t| {
        let from_ctx = &mut f.ctx as *mut Context;
        let to_ctx = &t.ctx as *const Context;
        unsafe { ctx::switch(from_ctx, to_ctx) };
    });
    debug_assert!(done.is_some());
}

/// Timer tick handler (spec.md §4.1 "Tick handler"); called with interrupts
/// disabled from the IDT's timer vector.
pub fn tick() {
    let mut s = STATE.lock();
    s.ticks += 1;
    walk_deadlines(&mut s);

    let cur = s.current.expect("scheduler running");
    let is_idle = s.idle.map(|i| i.0) == Some(cur.0);

    if !is_idle {
        let quantum_expired = arena::with_mut(cur, |t| {
            t.quantum = t.quantum.saturating_sub(1);
            t.quantum == 0
        })
        .unwrap_or(true);

        let higher_ready = {
            let cur_prio = arena::with(cur, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
            ready_head_priority(&s).map(|p| p < cur_prio).unwrap_or(false)
        };

        if !(quantum_expired || higher_ready) {
            return;
        }

        if s.preempt_depth > 0 {
            s.pending_resched = true;
            return;
        }

        if quantum_expired {
            arena::with_mut(cur, |t| t.quantum = DEFAULT_QUANTUM);
        }
    } else if s.preempt_depth > 0 {
        s.pending_resched = true;
        return;
    } else if ready_head_priority(&s).is_none() {
        return;
    }

    reschedule_locked(&mut s, false);
}

fn ready_head_priority(s: &SchedState) -> Option<u8> {
    s.ready.peek_front_priority()
}

fn reschedule_locked(s: &mut SchedState, voluntary: bool) {
    let cur = s.current.expect("scheduler running");
    let is_idle = s.idle.map(|i| i.0) == Some(cur.0);
    if !is_idle {
        arena::with_mut(cur, |t| {
            if voluntary {
                t.switches_voluntary += 1;
            } else {
                t.switches_involuntary += 1;
            }
            if t.state == TaskState::Running {
                t.state = TaskState::Ready;
            }
        });
        let prio = arena::with(cur, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
        if arena::with(cur, |t| t.state == TaskState::Ready).unwrap_or(false) {
            s.ready.push_back(cur, prio);
        }
    }
    let (next, _) = pick_next_locked(s);
    arena::with_mut(next, |t| t.quantum = DEFAULT_QUANTUM);
    s.pending_resched = false;
    switch_locked(s, cur, next);
}

/// Cooperative yield (spec.md §4.1 "Yield").
pub fn yield_now() {
    let mut s = STATE.lock();
    reschedule_locked(&mut s, true);
}

pub fn current_task() -> TaskIndex {
    STATE.lock().current.expect("scheduler running")
}

pub fn set_priority(idx: TaskIndex, priority: u8) -> Result<(), SchedError> {
    if !arena::is_live(idx) {
        return Err(SchedError::NoSuchTask);
    }
    let prio = priority.min(MAX_PRIORITY);
    let mut s = STATE.lock();
    let was_ready = arena::with(idx, |t| t.state == TaskState::Ready).unwrap_or(false);
    let old = arena::with(idx, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
    if was_ready {
        s.ready.remove(idx, old);
    }
    arena::with_mut(idx, |t| {
        t.base_priority = prio;
        t.effective_priority = prio;
    });
    if was_ready {
        s.ready.push_back(idx, prio);
    }
    Ok(())
}

pub fn get_priority(idx: TaskIndex) -> Result<u8, SchedError> {
    arena::with(idx, |t| t.base_priority).ok_or(SchedError::NoSuchTask)
}

/// `deadline = None` clears it (spec.md §4.1 "0 = clear").
pub fn set_deadline(idx: TaskIndex, deadline: Option<u64>) -> Result<(), SchedError> {
    if !arena::is_live(idx) {
        return Err(SchedError::NoSuchTask);
    }
    let mut s = STATE.lock();
    match deadline {
        Some(d) => {
            arena::with_mut(idx, |t| t.deadline = Some(d));
            s.deadlines.insert(idx, d);
        }
        None => {
            arena::with_mut(idx, |t| t.deadline = None);
            s.deadlines.remove(idx);
        }
    }
    Ok(())
}

pub fn get_deadline(idx: TaskIndex) -> Result<Option<u64>, SchedError> {
    arena::with(idx, |t| t.deadline).ok_or(SchedError::NoSuchTask)
}

/// Pin to CPU: accepted but a no-op until SMP lands (single CPU today, see
/// the `embodios-smp` feature flag).
pub fn pin_to_cpu(idx: TaskIndex, _cpu: u32) -> Result<(), SchedError> {
    if !arena::is_live(idx) {
        return Err(SchedError::NoSuchTask);
    }
    Ok(())
}

/// Nestable preemption disable (spec.md §4.1 "Disable/enable preemption").
pub fn preempt_disable() {
    STATE.lock().preempt_depth += 1;
}

pub fn preempt_enable() -> Result<(), SchedError> {
    let mut s = STATE.lock();
    if s.preempt_depth == 0 {
        return Err(SchedError::UnbalancedEnable);
    }
    s.preempt_depth -= 1;
    if s.preempt_depth == 0 && s.pending_resched {
        reschedule_locked(&mut s, false);
    }
    Ok(())
}

/// Blocks the current task on a resource `holder` owns (spec.md §4.1
/// "Priority inheritance protocol").
pub fn block_on(holder: TaskIndex) {
    let mut s = STATE.lock();
    let waiter = s.current.expect("scheduler running");
    let prio = arena::with(waiter, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
    s.ready.remove(waiter, prio);
    pip::add_waiter(&mut s.ready, holder, waiter);
    reschedule_locked(&mut s, true);
}

/// Wakes `waiter`, previously blocked on `holder`, restoring PIP state.
pub fn wake(holder: TaskIndex, waiter: TaskIndex) {
    let mut s = STATE.lock();
    pip::remove_waiter(&mut s.ready, holder, waiter);
    arena::with_mut(waiter, |t| t.state = TaskState::Ready);
    let prio = arena::with(waiter, |t| t.effective_priority).unwrap_or(MAX_PRIORITY);
    s.ready.push_back(waiter, prio);
}

pub fn inversion_count() -> u64 {
    pip::inversion_count()
}

pub fn ticks() -> u64 {
    STATE.lock().ticks
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_entry(_arg: usize) -> ! {
        loop {
            unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
        }
    }

    /// `create_task` allocates its stack from `memory::phys`, whose bitmap
    /// is global state shared with that module's own tests. Rather than
    /// relying on some other test having already called `phys::init` (or
    /// not having exhausted it), hold `phys::TEST_LOCK` and reset a region
    /// large enough for every stack this module's tests ever allocate.
    fn with_phys_ready<R>(f: impl FnOnce() -> R) -> R {
        let _guard = phys::TEST_LOCK.lock();
        phys::init(0, &[phys::PhysRegion { start: 0, len: (64 * PAGE_SIZE) as u64 }]);
        f()
    }

    #[test]
    fn priority_clamped_above_31() {
        with_phys_ready(|| {
            init();
            let t = create_task("t", noop_entry, 0, 255).unwrap();
            assert_eq!(get_priority(t).unwrap(), MAX_PRIORITY);
        });
    }

    #[test]
    fn set_then_get_priority_roundtrips() {
        with_phys_ready(|| {
            init();
            let t = create_task("t2", noop_entry, 0, 10).unwrap();
            set_priority(t, 3).unwrap();
            assert_eq!(get_priority(t).unwrap(), 3);
        });
    }
}
