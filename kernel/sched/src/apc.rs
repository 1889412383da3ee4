//! Asynchronous procedure calls: work that runs on a specific thread the
//! next time it is at `Irql::Passive`.

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::thread::Thread;

/// The kind of APC, which determines delivery ordering and the enable bit
/// it is gated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApcKind {
    /// Delivered before kernel APCs, independent of the kernel-APC enable bit.
    SpecialKernel = 0,
    /// Ordinary kernel APC.
    Kernel = 1,
    /// Delivered last, representing user-mode work (unused in this kernel's
    /// scope but kept for API symmetry with the APC model it implements).
    User = 2,
}

/// A caller-owned deferred-call record targeting a specific thread.
pub struct Apc {
    next: AtomicPtr<Apc>,
    enqueued: AtomicBool,
    cancelled: AtomicBool,
    kind: ApcKind,
    func: unsafe fn(*mut Apc),
}

// SAFETY: ownership is coordinated through `enqueued`/`cancelled` and the
// per-thread pending list; the embedding subsystem guarantees the pointee
// outlives any enqueue.
unsafe impl Send for Apc {}
unsafe impl Sync for Apc {}

impl Apc {
    /// Creates an unqueued APC of the given kind.
    #[must_use]
    pub const fn new(kind: ApcKind, func: unsafe fn(*mut Apc)) -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
            enqueued: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            kind,
            func,
        }
    }

    /// Cancels this APC if it has not yet been delivered.
    ///
    /// A cancelled APC is skipped during drain rather than removed from the
    /// list immediately, since removal would need the owning thread's lock.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Queues `apc` for delivery on `thread`, the next time `thread` is running
/// and IRQL drops to [`crate::irql::Irql::Passive`].
///
/// Returns `false` without effect if already enqueued. APCs travel with the
/// thread across migrations since the pending lists are embedded in the
/// `Thread` itself, not in per-CPU storage.
pub fn enqueue_on_thread(thread: &'static Thread, apc: &'static Apc) -> bool {
    if apc.enqueued.swap(true, Ordering::AcqRel) {
        return false;
    }

    let head_slot = &thread.apc_heads[apc.kind as usize];
    let apc_ptr: *mut Apc = core::ptr::from_ref(apc).cast_mut();
    loop {
        let old = head_slot.load(Ordering::Acquire);
        apc.next.store(old, Ordering::Relaxed);
        if head_slot
            .compare_exchange_weak(old, apc_ptr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
    thread.apc_mask.fetch_or(1 << (apc.kind as u8), Ordering::AcqRel);
    true
}

/// Delivers every enabled, non-cancelled APC pending on the current thread,
/// highest-urgency kind first within FIFO enqueue order per kind.
///
/// Called automatically by [`crate::irql::lower`] when IRQL reaches
/// [`crate::irql::Irql::Passive`]. A no-op before the scheduler has a
/// current thread (early boot).
pub fn deliver_pending() {
    let Some(thread) = crate::sched::current() else {
        return;
    };
    if thread.apc_mask.swap(0, Ordering::AcqRel) == 0 {
        return;
    }

    for kind_idx in 0..3 {
        let head = thread.apc_heads[kind_idx].swap(core::ptr::null_mut(), Ordering::AcqRel);
        run_list(head);
    }
}

fn run_list(head: *mut Apc) {
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: nodes were linked by `enqueue_on_thread` and are exclusively
        // owned by this drain now that the head was swapped out.
        let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
        unsafe {
            let was_cancelled = (*cursor).cancelled.swap(false, Ordering::AcqRel);
            (*cursor).enqueued.store(false, Ordering::Release);
            if !was_cancelled {
                ((*cursor).func)(cursor);
            }
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::PriorityClass;
    use core::sync::atomic::AtomicUsize;

    static RAN: AtomicUsize = AtomicUsize::new(0);

    unsafe fn bump(_apc: *mut Apc) {
        RAN.fetch_add(1, Ordering::Relaxed);
    }

    /// Makes a fresh thread the scheduler's current thread on this CPU, so
    /// `deliver_pending` (which dispatches off `sched::current()`) has
    /// something to act on.
    fn become_current() -> &'static Thread {
        let t = Box::leak(Box::new(Thread::new(PriorityClass::Urgent)));
        crate::sched::requeue(t);
        crate::sched::yield_now();
        assert!(core::ptr::eq(crate::sched::current().unwrap(), t));
        t
    }

    #[test]
    fn delivered_apc_runs_once() {
        static APC: Apc = Apc::new(ApcKind::Kernel, bump);
        RAN.store(0, Ordering::Relaxed);
        let thread = become_current();

        assert!(enqueue_on_thread(thread, &APC));
        deliver_pending();
        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancelled_apc_is_skipped() {
        static APC: Apc = Apc::new(ApcKind::Kernel, bump);
        RAN.store(0, Ordering::Relaxed);
        let thread = become_current();

        assert!(enqueue_on_thread(thread, &APC));
        APC.cancel();
        deliver_pending();
        assert_eq!(RAN.load(Ordering::Relaxed), 0);
    }
}
