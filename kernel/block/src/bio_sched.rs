//! Per-disk block I/O scheduler: five priority queues, LBA-adjacent
//! coalescing, and an anti-starvation boost so a steady stream of high
//! priority work cannot stall lower-priority requests indefinitely.
//!
//! Dispatch runs from a [`hadron_sched::dpc::Dpc`], the same deferred
//! context the scheduler uses for its own tick work, rather than from the
//! submitter's stack: `enqueue` only links the request and arms the DPC if
//! it was not already pending.

use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use hadron_core::sync::IrqSpinLock;
use hadron_sched::dpc::Dpc;

use crate::bio::{BioRequest, BioRequestPriority, BioStatus};
use crate::disk::GenericDiskFlags;

/// Baseline wait, in scheduler ticks, before a queue of this priority is
/// eligible for its first starvation boost. Background waits longest before
/// boosting since it has no waiter; High boosts fastest since it already
/// sits near the top and any further wait is surprising.
const BASE_WAIT_TICKS: [u64; BioRequestPriority::COUNT] = [64, 32, 16, 8, 0];

/// Minimum wait enforced regardless of how many boosts have already applied,
/// so a request can never be promoted instantly on every tick once boosted
/// enough times to shift the base wait to zero.
const MIN_WAIT_TICKS: u64 = 2;

/// Upper bound on right-shifts applied to a queue's base wait by repeated
/// boosting, so `adjusted_wait` converges to `MIN_WAIT_TICKS` instead of
/// hitting zero and promoting every tick.
const BOOST_SHIFT_LIMIT: u32 = 6;

/// Upper bound on promotions scanned and applied in a single tick, so one
/// tick's dispatch cost stays bounded regardless of queue depth.
const MAX_BOOST_SCAN: usize = 64;

/// Maximum LBA gap between two pending requests for them to coalesce into a
/// single dispatched transfer.
const COALESCE_MAX_GAP_SECTORS: u64 = 0;

const MAX_QUEUE_DEPTH: usize = 256;

struct PriorityQueue {
    lock: IrqSpinLock<()>,
    head: AtomicPtr<BioRequest>,
    tail: AtomicPtr<BioRequest>,
    len: AtomicUsize,
}

impl PriorityQueue {
    const fn new() -> Self {
        Self {
            lock: IrqSpinLock::new(()),
            head: AtomicPtr::new(core::ptr::null_mut()),
            tail: AtomicPtr::new(core::ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    fn push_back(&self, req: &'static BioRequest) {
        let _g = self.lock.lock();
        let ptr: *mut BioRequest = core::ptr::from_ref(req).cast_mut();
        req.queue_next.store(core::ptr::null_mut(), Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.is_null() {
            self.head.store(ptr, Ordering::Relaxed);
        } else {
            // SAFETY: `tail` is the last node pushed by this queue, live
            // while queued.
            unsafe { (*tail).queue_next.store(ptr, Ordering::Relaxed) };
        }
        self.tail.store(ptr, Ordering::Relaxed);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_front(&self) -> Option<&'static BioRequest> {
        let _g = self.lock.lock();
        let head = self.head.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        // SAFETY: `head` was linked by `push_back` and remains valid until
        // popped.
        let next = unsafe { (*head).queue_next.load(Ordering::Relaxed) };
        self.head.store(next, Ordering::Relaxed);
        if next.is_null() {
            self.tail.store(core::ptr::null_mut(), Ordering::Relaxed);
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: ownership passes to the caller, which dispatches or
        // re-queues it.
        Some(unsafe { &*head })
    }

    /// Sorts the queue's linked list by ascending LBA (insertion sort: queue
    /// depths stay small enough in practice, bounded by [`MAX_QUEUE_DEPTH`],
    /// that an O(n^2) worst case on an already-mostly-sorted list is cheaper
    /// than maintaining a separate ordered structure).
    fn reorder_by_lba(&self) {
        let _g = self.lock.lock();
        let mut sorted: *mut BioRequest = core::ptr::null_mut();
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            // SAFETY: walking the list held under this queue's lock.
            let next = unsafe { (*cursor).queue_next.load(Ordering::Relaxed) };

            if sorted.is_null() || unsafe { (*cursor).lba } < unsafe { (*sorted).lba } {
                unsafe { (*cursor).queue_next.store(sorted, Ordering::Relaxed) };
                sorted = cursor;
            } else {
                let mut prev = sorted;
                loop {
                    // SAFETY: `prev` walks the already-sorted prefix.
                    let prev_next = unsafe { (*prev).queue_next.load(Ordering::Relaxed) };
                    if prev_next.is_null() || unsafe { (*cursor).lba } < unsafe { (*prev_next).lba } {
                        unsafe { (*cursor).queue_next.store(prev_next, Ordering::Relaxed) };
                        unsafe { (*prev).queue_next.store(cursor, Ordering::Relaxed) };
                        break;
                    }
                    prev = prev_next;
                }
            }
            cursor = next;
        }
        self.head.store(sorted, Ordering::Relaxed);
        let mut tail = sorted;
        if !tail.is_null() {
            while unsafe { !(*tail).queue_next.load(Ordering::Relaxed).is_null() } {
                tail = unsafe { (*tail).queue_next.load(Ordering::Relaxed) };
            }
        }
        self.tail.store(tail, Ordering::Relaxed);
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn peek_front(&self) -> Option<&'static BioRequest> {
        let _g = self.lock.lock();
        let head = self.head.load(Ordering::Relaxed);
        if head.is_null() {
            None
        } else {
            // SAFETY: queued nodes remain valid while linked.
            Some(unsafe { &*head })
        }
    }
}

/// Per-disk scheduler state.
///
/// Caller-owned like every other scheduling object in this kernel: a driver
/// embeds one `BioScheduler` per disk it registers and hands a `'static`
/// reference to [`enqueue`].
pub struct BioScheduler {
    queues: [PriorityQueue; BioRequestPriority::COUNT],
    total_queued: AtomicUsize,
    clock: AtomicU64,
    dpc: Dpc,
}

// SAFETY: queues and counters are independently synchronized; the DPC's
// embedded function pointer closes over no external state.
unsafe impl Send for BioScheduler {}
unsafe impl Sync for BioScheduler {}

impl BioScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queues: [
                PriorityQueue::new(),
                PriorityQueue::new(),
                PriorityQueue::new(),
                PriorityQueue::new(),
                PriorityQueue::new(),
            ],
            total_queued: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            dpc: Dpc::new(run_dpc),
        }
    }

    /// Logical scheduler clock, advanced by [`BioScheduler::tick`]. Used for
    /// wait-time accounting instead of wall time so the scheduler's boost
    /// behavior is deterministic and host-testable.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Submits `req` for scheduling.
    ///
    /// [`BioRequestPriority::Urgent`] requests and requests targeting a disk
    /// with [`GenericDiskFlags::NO_SCHED`] bypass every queue and dispatch
    /// immediately on the calling thread; both invariants mean the
    /// scheduler's urgent queue is always empty and every queued request's
    /// priority is at most [`BioRequestPriority::High`].
    pub fn enqueue(&self, req: &'static BioRequest) {
        if req.priority() == BioRequestPriority::Urgent || req.disk.flags.contains(GenericDiskFlags::NO_SCHED) {
            dispatch_one(req);
            return;
        }

        req.set_status(BioStatus::Queued);
        req.enqueue_tick.store(self.now(), Ordering::Release);
        let queue = &self.queues[req.priority() as usize];
        queue.push_back(req);
        self.total_queued.fetch_add(1, Ordering::AcqRel);

        hadron_sched::dpc::enqueue(&self.dpc);
    }

    /// Advances the logical clock by one and applies starvation boosts,
    /// then dispatches everything currently eligible. Intended to be called
    /// periodically (e.g. from the same tick source as the scheduler's own
    /// quantum accounting) in addition to the DPC armed by `enqueue`.
    pub fn tick(&'static self) {
        self.clock.fetch_add(1, Ordering::AcqRel);
        self.apply_boosts();
        self.dispatch_all();
    }

    fn apply_boosts(&self) {
        let now = self.now();
        for prio_idx in 0..BioRequestPriority::COUNT - 1 {
            let queue = &self.queues[prio_idx];
            let mut scanned = 0;
            while scanned < MAX_BOOST_SCAN {
                let Some(req) = queue.peek_front() else {
                    break;
                };
                let boosts = req.boost_count.load(Ordering::Acquire);
                let adjusted_wait = (BASE_WAIT_TICKS[prio_idx] >> boosts.min(BOOST_SHIFT_LIMIT as u8)).max(MIN_WAIT_TICKS);
                let waited = now.saturating_sub(req.enqueue_tick.load(Ordering::Acquire));
                if waited < adjusted_wait {
                    break;
                }

                let next_prio = match req.priority() {
                    BioRequestPriority::Background => BioRequestPriority::Low,
                    BioRequestPriority::Low => BioRequestPriority::Medium,
                    BioRequestPriority::Medium => BioRequestPriority::High,
                    BioRequestPriority::High | BioRequestPriority::Urgent => BioRequestPriority::High,
                };
                if self.queues[next_prio as usize].len() >= MAX_QUEUE_DEPTH {
                    // Target queue is already saturated; leave this request
                    // where it is rather than piling more onto a queue that
                    // cannot drain fast enough either.
                    break;
                }

                let Some(popped) = queue.pop_front() else {
                    break;
                };
                popped.boost_count.fetch_add(1, Ordering::AcqRel);
                popped.set_priority(next_prio);
                popped.enqueue_tick.store(now, Ordering::Release);
                self.queues[next_prio as usize].push_back(popped);
                scanned += 1;
            }
        }
    }

    fn should_coalesce(a: &BioRequest, b: &BioRequest) -> bool {
        a.write == b.write
            && core::ptr::eq(a.disk, b.disk)
            && a.lba + u64::from(a.sector_count) + COALESCE_MAX_GAP_SECTORS >= b.lba
            && a.lba <= b.lba
    }

    /// Dispatches everything currently queued, highest priority first,
    /// reordering each queue by LBA and coalescing adjacent requests before
    /// sending them to the disk.
    pub fn dispatch_all(&self) {
        for prio_idx in (0..BioRequestPriority::COUNT - 1).rev() {
            let queue = &self.queues[prio_idx];
            if queue.len() == 0 {
                continue;
            }
            queue.reorder_by_lba();
            self.dispatch_partial(queue);
        }
    }

    fn dispatch_partial(&self, queue: &PriorityQueue) {
        let mut pending: Option<&'static BioRequest> = None;
        while let Some(req) = queue.pop_front() {
            self.total_queued.fetch_sub(1, Ordering::AcqRel);
            match pending {
                None => pending = Some(req),
                Some(head) if Self::should_coalesce(head, req) => {
                    req.is_aggregate.store(true, Ordering::Release);
                    let mut tail = head;
                    loop {
                        let next = tail.next_coalesced.load(Ordering::Acquire);
                        if next.is_null() {
                            break;
                        }
                        // SAFETY: chain members stay valid until the head
                        // dispatches and completes.
                        tail = unsafe { &*next };
                    }
                    tail.next_coalesced
                        .store(core::ptr::from_ref(req).cast_mut(), Ordering::Release);
                }
                Some(head) => {
                    dispatch_one(head);
                    pending = Some(req);
                }
            }
        }
        if let Some(head) = pending {
            dispatch_one(head);
        }
    }

    /// Number of requests queued across every priority, not counting
    /// urgent/no-sched bypasses.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.total_queued.load(Ordering::Acquire)
    }
}

impl Default for BioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches `req` and, if it is a coalesce-chain head, every request
/// folded into it, each against its own buffer.
///
/// A coalesced chain is adjacent on disk but not necessarily in memory (its
/// members' buffers were supplied independently by whatever callers
/// submitted them), so this issues one disk operation per member rather
/// than synthesizing a single oversized transfer; the benefit of coalescing
/// is the back-to-back LBA-ordered dispatch, not a merged buffer.
fn dispatch_one(req: &'static BioRequest) {
    req.set_status(BioStatus::Inflight);

    let mut status = BioStatus::Ok;
    let mut cursor: *const BioRequest = req;
    while !cursor.is_null() {
        // SAFETY: `cursor` starts at `req` and then walks `next_coalesced`,
        // whose members stay valid until this dispatch completes the chain.
        let member = unsafe { &*cursor };
        // SAFETY: `member.buffer` is valid for `sector_count * sector_size`
        // bytes per the submitter's contract.
        let buf_len = (member.sector_count as usize) * (member.disk.sector_size as usize);
        let result = if member.write {
            let slice = unsafe { core::slice::from_raw_parts(member.buffer, buf_len) };
            member.disk.write_raw(member.lba, member.sector_count, slice)
        } else {
            let slice = unsafe { core::slice::from_raw_parts_mut(member.buffer, buf_len) };
            member.disk.read_raw(member.lba, member.sector_count, slice)
        };
        if let Err(e) = result {
            status = if e == hadron_core::error::KernelError::Timeout {
                BioStatus::ErrTimeout
            } else {
                BioStatus::ErrIo
            };
            break;
        }
        cursor = member.next_coalesced.load(Ordering::Acquire);
    }

    req.complete_chain(status);
}

unsafe fn run_dpc(dpc: *mut Dpc) {
    let offset = core::mem::offset_of!(BioScheduler, dpc);
    // SAFETY: `dpc` always points at the `dpc` field of some `'static
    // BioScheduler` armed by `enqueue`, which outlives the DPC per that
    // method's caller-owned contract; `byte_sub` recovers the container the
    // same way a C `container_of` would.
    let sched = unsafe { &*dpc.byte_sub(offset).cast::<BioScheduler>() };
    sched.dispatch_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskOps, GenericDiskFlags, GenericDiskType};
    use std::sync::Mutex as StdMutex;

    static DISPATCHED: StdMutex<Vec<u64>> = StdMutex::new(Vec::new());

    unsafe fn record_read(_d: *mut (), lba: u64, count: u32, _buf: *mut u8) -> Result<u32, hadron_core::error::KernelError> {
        DISPATCHED.lock().unwrap().push(lba);
        Ok(count)
    }
    unsafe fn record_write(_d: *mut (), lba: u64, count: u32, _buf: *const u8) -> Result<u32, hadron_core::error::KernelError> {
        DISPATCHED.lock().unwrap().push(lba);
        Ok(count)
    }

    static TEST_DISK: GenericDisk = GenericDisk::new(
        "schedtest",
        GenericDiskType::Virtual,
        GenericDiskFlags::empty(),
        512,
        65536,
        core::ptr::null_mut(),
        DiskOps {
            read_sectors: record_read,
            write_sectors: record_write,
        },
    );

    static NO_SCHED_DISK: GenericDisk = GenericDisk::new(
        "noschedtest",
        GenericDiskType::Virtual,
        GenericDiskFlags::NO_SCHED,
        512,
        65536,
        core::ptr::null_mut(),
        DiskOps {
            read_sectors: record_read,
            write_sectors: record_write,
        },
    );

    #[test]
    fn urgent_requests_bypass_every_queue() {
        static SCHED: BioScheduler = BioScheduler::new();
        DISPATCHED.lock().unwrap().clear();
        let mut buf = [0u8; 512];
        let req = BioRequest::new(&TEST_DISK, 5, 1, buf.as_mut_ptr(), false, BioRequestPriority::Urgent, None);
        let req: &'static BioRequest = Box::leak(Box::new(req));
        SCHED.enqueue(req);

        assert_eq!(SCHED.queued_count(), 0);
        for q in &SCHED.queues {
            assert_eq!(q.len(), 0);
        }
        assert_eq!(*DISPATCHED.lock().unwrap(), vec![5]);
    }

    #[test]
    fn no_sched_disk_dispatches_immediately() {
        static SCHED: BioScheduler = BioScheduler::new();
        DISPATCHED.lock().unwrap().clear();
        let mut buf = [0u8; 512];
        let req = BioRequest::new(&NO_SCHED_DISK, 7, 1, buf.as_mut_ptr(), false, BioRequestPriority::Background, None);
        let req: &'static BioRequest = Box::leak(Box::new(req));
        SCHED.enqueue(req);
        assert_eq!(SCHED.queued_count(), 0);
        assert_eq!(*DISPATCHED.lock().unwrap(), vec![7]);
    }

    #[test]
    fn queued_requests_never_exceed_high_priority() {
        static SCHED: BioScheduler = BioScheduler::new();
        let mut buf = [0u8; 512];
        let req = BioRequest::new(&TEST_DISK, 1, 1, buf.as_mut_ptr(), false, BioRequestPriority::Medium, None);
        let req: &'static BioRequest = Box::leak(Box::new(req));
        SCHED.enqueue(req);
        assert!(req.priority() <= BioRequestPriority::High);
        SCHED.dispatch_all();
    }

    #[test]
    fn reorder_dispatches_in_ascending_lba_order() {
        static SCHED: BioScheduler = BioScheduler::new();
        DISPATCHED.lock().unwrap().clear();
        let mut bufs = [[0u8; 512]; 3];
        let lbas = [30u64, 10, 20];
        let reqs: Vec<&'static BioRequest> = lbas
            .iter()
            .zip(bufs.iter_mut())
            .map(|(&lba, buf)| {
                let req = BioRequest::new(&TEST_DISK, lba, 1, buf.as_mut_ptr(), false, BioRequestPriority::Medium, None);
                let req: &'static BioRequest = Box::leak(Box::new(req));
                req
            })
            .collect();
        for req in &reqs {
            SCHED.enqueue(req);
        }
        SCHED.dispatch_all();
        assert_eq!(*DISPATCHED.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn starved_background_request_is_eventually_promoted() {
        static SCHED: BioScheduler = BioScheduler::new();
        let mut buf = [0u8; 512];
        let req = BioRequest::new(&TEST_DISK, 99, 1, buf.as_mut_ptr(), false, BioRequestPriority::Background, None);
        let req: &'static BioRequest = Box::leak(Box::new(req));
        SCHED.enqueue(req);

        for _ in 0..(BASE_WAIT_TICKS[BioRequestPriority::Background as usize] + 1) {
            SCHED.clock.fetch_add(1, Ordering::AcqRel);
            SCHED.apply_boosts();
        }

        assert_eq!(req.priority(), BioRequestPriority::Low);
    }

    #[test]
    fn adjacent_writes_coalesce_into_one_chain() {
        static SCHED: BioScheduler = BioScheduler::new();
        DISPATCHED.lock().unwrap().clear();
        let mut buf_a = [0u8; 512];
        let mut buf_b = [0u8; 512];
        let a = BioRequest::new(&TEST_DISK, 40, 1, buf_a.as_mut_ptr(), true, BioRequestPriority::Medium, None);
        let b = BioRequest::new(&TEST_DISK, 41, 1, buf_b.as_mut_ptr(), true, BioRequestPriority::Medium, None);
        let a: &'static BioRequest = Box::leak(Box::new(a));
        let b: &'static BioRequest = Box::leak(Box::new(b));
        SCHED.enqueue(a);
        SCHED.enqueue(b);
        SCHED.dispatch_all();

        // Dispatched back-to-back in LBA order as one coalesce chain, each
        // against its own buffer.
        assert_eq!(*DISPATCHED.lock().unwrap(), vec![40, 41]);
        assert_eq!(a.status(), BioStatus::Ok);
        assert_eq!(b.status(), BioStatus::Ok);
        assert!(b.is_aggregate.load(Ordering::Relaxed));
    }
}
