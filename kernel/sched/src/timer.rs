//! A software timer queue driven by an external periodic tick.
//!
//! There is no HPET/TSC-deadline wiring here — `hadron_kernel`'s timer
//! interrupt handler calls [`tick`] once per period. This crate only
//! tracks a monotonic tick counter and a small fixed-capacity table of
//! pending timeouts, each guarded by the waiting thread's
//! [`crate::thread::WaitCookie`] so a timeout that fires after its wait
//! already completed is silently ignored.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hadron_core::sync::IrqSpinLock;

use crate::thread::Thread;

/// Maximum number of outstanding timed waits. Generous for a single-box
/// kernel; exceeding it fails [`schedule_timeout`] rather than allocating.
const MAX_PENDING: usize = 256;

static TICKS: AtomicU64 = AtomicU64::new(0);

struct Pending {
    active: AtomicBool,
    deadline: AtomicU64,
    cookie: AtomicU64,
    thread: core::sync::atomic::AtomicPtr<Thread>,
}

impl Pending {
    const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            deadline: AtomicU64::new(0),
            cookie: AtomicU64::new(0),
            thread: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

static TABLE: IrqSpinLock<[Pending; MAX_PENDING]> =
    IrqSpinLock::new([const { Pending::new() }; MAX_PENDING]);

/// Returns the current tick count.
#[must_use]
pub fn now() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Advances the tick counter by one and wakes any thread whose deadline has
/// passed and whose wait cookie still matches (i.e. it has not already been
/// woken by a signal).
///
/// Must be called from the timer interrupt handler, not from thread context.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    let guard = TABLE.lock();
    for slot in guard.iter() {
        if !slot.active.load(Ordering::Acquire) {
            continue;
        }
        if slot.deadline.load(Ordering::Acquire) > now {
            continue;
        }
        let thread_ptr = slot.thread.load(Ordering::Acquire);
        let cookie = slot.cookie.load(Ordering::Acquire);
        slot.active.store(false, Ordering::Release);
        if thread_ptr.is_null() {
            continue;
        }
        // SAFETY: `thread_ptr` was stored by `schedule_timeout` as a
        // `'static` reference that stays valid until woken.
        let thread = unsafe { &*thread_ptr };
        if thread.wait_cookie.is_current(cookie) {
            thread.set_state(crate::thread::ThreadState::Ready);
            crate::sched::requeue(thread);
        }
    }
}

/// Registers `thread` to be woken at `deadline` (an absolute tick count)
/// unless its wait cookie has already advanced past `cookie` by then.
///
/// Returns `false` if the pending-timeout table is full; the caller should
/// treat this the same as an immediate timeout in that case, since there is
/// no room to track it.
pub fn schedule_timeout(thread: &'static Thread, cookie: u64, deadline: u64) -> bool {
    let guard = TABLE.lock();
    for slot in guard.iter() {
        if slot
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            slot.deadline.store(deadline, Ordering::Release);
            slot.cookie.store(cookie, Ordering::Release);
            slot.thread
                .store(core::ptr::from_ref(thread).cast_mut(), Ordering::Release);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_monotonically() {
        let before = now();
        tick();
        assert_eq!(now(), before + 1);
    }
}
