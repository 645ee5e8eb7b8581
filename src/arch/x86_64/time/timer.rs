//! Tick source for the scheduler (spec.md §4.1: "invoked from the periodic
//! timer, nominal 100 Hz"). Deadlines and quanta throughout `sched` are
//! counted in ticks, not wall-clock time, so all this module owns is a
//! monotonic tick counter advanced by the PIT/PIC IRQ0 handler in `idt.rs`.

use core::sync::atomic::{AtomicU64, Ordering};

pub const TICK_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Called once per timer interrupt, before `sched::tick()` runs.
pub fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Current tick count since boot.
pub fn now_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
