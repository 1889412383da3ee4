//! Deferred procedure calls: work that runs at `Irql::Dispatch` once the
//! interrupt handler that queued it returns.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use hadron_core::cpu_local::{CpuLocal, MAX_CPUS};

/// A caller-owned deferred-call record.
///
/// Like [`crate::turnstile`]'s wait-queue nodes, DPCs are not allocated by
/// this crate: embed one in the device or subsystem that queues it.
pub struct Dpc {
    next: AtomicPtr<Dpc>,
    enqueued: AtomicBool,
    func: unsafe fn(*mut Dpc),
}

// SAFETY: ownership is coordinated entirely through the `enqueued` flag and
// the per-CPU stack; the embedding subsystem guarantees the pointee outlives
// any enqueue.
unsafe impl Send for Dpc {}
unsafe impl Sync for Dpc {}

impl Dpc {
    /// Creates an unqueued DPC that will call `func` when it runs.
    #[must_use]
    pub const fn new(func: unsafe fn(*mut Dpc)) -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
            enqueued: AtomicBool::new(false),
            func,
        }
    }
}

struct PerCpuQueue {
    head: AtomicPtr<Dpc>,
    queued: AtomicU8,
}

impl PerCpuQueue {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            queued: AtomicU8::new(0),
        }
    }
}

static QUEUES: CpuLocal<PerCpuQueue> =
    CpuLocal::new([const { PerCpuQueue::new() }; MAX_CPUS]);

/// Enqueues `dpc` to run on `cpu`.
///
/// Returns `false` without effect if `dpc` was already enqueued. Sends an
/// IPI to `cpu` if it is not the caller's own CPU and the queue transitions
/// from empty to non-empty.
pub fn enqueue_on_cpu(cpu: u32, dpc: &'static Dpc) -> bool {
    if dpc.enqueued.swap(true, Ordering::AcqRel) {
        return false;
    }

    let queue = QUEUES.get_for(cpu);
    let dpc_ptr: *mut Dpc = core::ptr::from_ref(dpc).cast_mut();
    loop {
        let old_head = queue.head.load(Ordering::Acquire);
        dpc.next.store(old_head, Ordering::Relaxed);
        if queue
            .head
            .compare_exchange_weak(old_head, dpc_ptr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }

    let was_empty = queue.queued.swap(1, Ordering::AcqRel) == 0;
    if was_empty && cpu != hadron_core::cpu_local::current_cpu_id() {
        send_dpc_ipi(cpu);
    }
    true
}

/// Enqueues `dpc` on the calling CPU.
pub fn enqueue(dpc: &'static Dpc) -> bool {
    enqueue_on_cpu(hadron_core::cpu_local::current_cpu_id(), dpc)
}

/// Architecture hook for delivering the DPC IPI to a remote CPU.
///
/// Stubbed until SMP/APIC bring-up is wired in; see `hadron_kernel`'s
/// interrupt controller driver for the real implementation.
fn send_dpc_ipi(_cpu: u32) {}

/// Drains and runs every DPC queued on the current CPU.
///
/// Must be called at `Irql::Dispatch`. DPCs must not block.
pub fn drain_current() {
    let queue = QUEUES.get_for(hadron_core::cpu_local::current_cpu_id());
    queue.queued.store(0, Ordering::Release);

    let head = queue.head.swap(core::ptr::null_mut(), Ordering::AcqRel);
    // The CAS-pushed stack is LIFO; reverse it so DPCs run in enqueue order.
    let mut reversed: *mut Dpc = core::ptr::null_mut();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: nodes in this chain were linked by `enqueue_on_cpu` and are
        // exclusively owned by this drain now that the head was swapped out.
        let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
        unsafe { (*cursor).next.store(reversed, Ordering::Relaxed) };
        reversed = cursor;
        cursor = next;
    }

    let mut cursor = reversed;
    while !cursor.is_null() {
        // SAFETY: see above.
        let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
        unsafe {
            (*cursor).enqueued.store(false, Ordering::Release);
            ((*cursor).func)(cursor);
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static RAN: AtomicUsize = AtomicUsize::new(0);

    unsafe fn bump(_dpc: *mut Dpc) {
        RAN.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn enqueue_then_drain_runs_once() {
        static DPC: Dpc = Dpc::new(bump);
        RAN.store(0, Ordering::Relaxed);

        assert!(enqueue(&DPC));
        assert!(!enqueue(&DPC), "double enqueue must be a no-op");

        drain_current();
        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }
}
