//! Interrupt request level (IRQL) tracking.
//!
//! IRQL is a per-CPU priority for interrupt and preemption masking. Raising
//! IRQL is cheap and local; the actual effect (disabling preemption,
//! disabling hardware interrupts) is a side effect of crossing specific
//! thresholds, not of the numeric value itself.

use hadron_core::cpu_local::{CpuLocal, MAX_CPUS};
use hadron_intrinsics::{disable_interrupts, enable_interrupts};
use core::sync::atomic::{AtomicU8, Ordering};

/// The interrupt request level, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Irql {
    /// Normal thread execution. APCs deliver here.
    Passive = 0,
    /// APCs are blocked; used while an APC itself runs.
    Apc = 1,
    /// Preemption is disabled. DPCs run here.
    Dispatch = 2,
    /// Device interrupt handlers run here.
    Device = 3,
    /// Hardware interrupts are disabled. Highest level.
    High = 4,
}

impl Irql {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Passive,
            1 => Self::Apc,
            2 => Self::Dispatch,
            3 => Self::Device,
            _ => Self::High,
        }
    }
}

static CURRENT_IRQL: CpuLocal<AtomicU8> =
    CpuLocal::new([const { AtomicU8::new(0) }; MAX_CPUS]);

static NEEDS_RESCHED: CpuLocal<AtomicU8> =
    CpuLocal::new([const { AtomicU8::new(0) }; MAX_CPUS]);

/// Returns the current CPU's IRQL.
#[must_use]
pub fn current() -> Irql {
    Irql::from_u8(CURRENT_IRQL.get().load(Ordering::Relaxed))
}

/// Raises the current CPU's IRQL to `new`, returning the previous level.
///
/// Crossing to [`Irql::Dispatch`] or above disables preemption; crossing to
/// [`Irql::High`] additionally disables hardware interrupts.
///
/// # Panics
///
/// Panics if `new` is lower than the current IRQL: IRQL may only be raised
/// through this function, never lowered.
pub fn raise(new: Irql) -> Irql {
    let old = current();
    assert!(new >= old, "hadron_sched: cannot raise IRQL from {old:?} to {new:?}");
    if new >= Irql::High && old < Irql::High {
        disable_interrupts();
    }
    CURRENT_IRQL.get().store(new as u8, Ordering::Relaxed);
    old
}

/// Lowers the current CPU's IRQL to `new`.
///
/// Lowering to [`Irql::Passive`] delivers any pending kernel APCs on the
/// current thread before returning. Lowering to [`Irql::Dispatch`] or below
/// checks the resched-needed flag and yields if set.
///
/// # Panics
///
/// Panics if `new` is higher than the current IRQL.
pub fn lower(new: Irql) {
    let old = current();
    assert!(new <= old, "hadron_sched: cannot lower IRQL from {old:?} to {new:?}");
    CURRENT_IRQL.get().store(new as u8, Ordering::Relaxed);
    if old >= Irql::High && new < Irql::High {
        // SAFETY: lowering below HIGH is exactly the documented precondition
        // for re-enabling interrupts.
        unsafe { enable_interrupts() };
    }
    if new == Irql::Passive {
        crate::apc::deliver_pending();
    }
    if new <= Irql::Dispatch && resched_needed() {
        crate::sched::yield_now();
    }
}

/// Marks the current CPU as needing a reschedule at the next opportunity.
pub fn request_resched() {
    NEEDS_RESCHED.get().store(1, Ordering::Relaxed);
}

/// Returns and clears whether the current CPU has a pending reschedule request.
pub fn take_resched_needed() -> bool {
    NEEDS_RESCHED.get().swap(0, Ordering::Relaxed) != 0
}

fn resched_needed() -> bool {
    NEEDS_RESCHED.get().load(Ordering::Relaxed) != 0
}

/// RAII guard that raises IRQL on construction and restores the previous
/// level on drop.
pub struct IrqlGuard {
    prev: Irql,
}

impl IrqlGuard {
    /// Raises IRQL to `new`, returning a guard that restores the prior level.
    pub fn raise(new: Irql) -> Self {
        Self { prev: raise(new) }
    }
}

impl Drop for IrqlGuard {
    fn drop(&mut self) {
        lower(self.prev);
    }
}
