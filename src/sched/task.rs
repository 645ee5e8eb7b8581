//! Ergonomic task-creation surface over the raw `0..=31` priority scale the
//! scheduler core uses internally. Named priority bands mirror the
//! teacher's own `Priority` enum; numeric values are chosen so `Realtime`
//! lands at the deadline-boost priority and `Idle` at the scheduler's
//! floor.

use bitflags::bitflags;

use super::arena::TaskIndex;
use super::ctx::EntryFn;
use super::{create_task, SchedError};

pub type TaskId = TaskIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Realtime = 0,
    High = 8,
    Normal = 16,
    Low = 24,
    Idle = 31,
}

bitflags! {
    /// CPU affinity mask. `ANY` is the only meaningful value until SMP
    /// support (the `embodios-smp` feature) lands.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Affinity: u64 {
        const ANY = u64::MAX;
    }
}

/// Spawns a kernel task at a named priority band.
pub fn kspawn(
    name: &str,
    entry: EntryFn,
    arg: usize,
    priority: Priority,
    affinity: Affinity,
) -> Result<TaskId, SchedError> {
    let id = create_task(name, entry, arg, priority as u8)?;
    if affinity != Affinity::ANY {
        let _ = super::pin_to_cpu(id, 0);
    }
    Ok(id)
}
