//! Block I/O requests.
//!
//! A [`BioRequest`] is caller-owned, like a [`hadron_sched::dpc::Dpc`]: the
//! submitter embeds one in whatever object is waiting on the I/O (a page
//! cache entry, a filesystem journal record) and hands a `'static`
//! reference to [`crate::bio_sched`]. Completion runs a caller-supplied
//! function pointer rather than waking a future, so this layer has no
//! dependency on an async executor.

use core::sync::atomic::{AtomicBool, AtomicI8, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::disk::GenericDisk;

/// Scheduling priority of a block I/O request.
///
/// Ordered from least to most eager to run. [`BioRequestPriority::Urgent`]
/// is reserved for synchronous, caller-blocking reads that must never wait
/// behind the I/O scheduler's queues at all; such requests dispatch straight
/// to the disk and are never actually enqueued (see
/// `bio_sched::BioScheduler::enqueue`), so the scheduler's urgent queue is
/// always empty by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BioRequestPriority {
    /// Prefetch and other work with no waiter.
    Background = 0,
    /// Writeback of cache entries not yet urgently needed.
    Low = 1,
    /// Ordinary file I/O.
    Medium = 2,
    /// Metadata and journal I/O.
    High = 3,
    /// Bypasses the scheduler; never queued.
    Urgent = 4,
}

impl BioRequestPriority {
    /// Number of distinct priorities, i.e. number of scheduler queues.
    pub const COUNT: usize = 5;
}

/// Terminal and in-flight states of a [`BioRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum BioStatus {
    /// Not yet submitted.
    Pending = 0,
    /// Queued in the scheduler, not yet dispatched.
    Queued = 1,
    /// Dispatched to the driver, awaiting completion.
    Inflight = 2,
    /// Completed successfully.
    Ok = 3,
    /// Folded into another request's `next_coalesced` chain; completes when
    /// the head of that chain completes.
    Coalesced = 4,
    /// Driver reported a medium error.
    ErrIo = -1,
    /// Request validation failed (bad LBA range, zero length).
    ErrInval = -2,
    /// Driver-level timeout.
    ErrTimeout = -3,
    /// Disk is read-only and this was a write.
    ErrReadOnly = -4,
}

/// A caller-owned block I/O request.
///
/// Must not be moved or dropped while enqueued in a [`crate::bio_sched::BioScheduler`]
/// or linked into another request's coalesce chain.
pub struct BioRequest {
    /// Disk this request targets.
    pub disk: &'static GenericDisk,
    /// First sector.
    pub lba: u64,
    /// Number of sectors.
    pub sector_count: u32,
    /// Data buffer: at least `sector_count * disk.sector_size` bytes, valid
    /// for the lifetime of the request.
    pub buffer: *mut u8,
    /// `true` for a write, `false` for a read.
    pub write: bool,
    priority: AtomicU8,
    /// Logical enqueue time, in [`crate::bio_sched`] clock ticks. Used by
    /// the anti-starvation boost to compute how long a request has waited.
    pub(crate) enqueue_tick: AtomicU64,
    /// Number of boost passes already applied to this request's effective
    /// wait threshold.
    pub(crate) boost_count: AtomicU8,
    status: AtomicI8,
    /// `true` if this request was absorbed into a neighbor's coalesce chain
    /// and must not be dispatched on its own.
    pub(crate) is_aggregate: AtomicBool,
    /// Next request folded into this one's completion, or null.
    pub(crate) next_coalesced: AtomicPtr<BioRequest>,
    /// Intrusive scheduler queue link.
    pub(crate) queue_next: AtomicPtr<BioRequest>,
    /// Completion callback, invoked exactly once per request (and, for an
    /// aggregate's members, once per member) when its status becomes
    /// terminal.
    on_complete: Option<unsafe fn(*mut BioRequest)>,
}

// SAFETY: the buffer and disk reference are valid for the request's full
// lifetime per the submitter's contract, the same guarantee this kernel
// requires of `Dpc`/`Apc` callback targets.
unsafe impl Send for BioRequest {}
unsafe impl Sync for BioRequest {}

impl BioRequest {
    /// Creates a new, unsubmitted request.
    #[must_use]
    pub const fn new(
        disk: &'static GenericDisk,
        lba: u64,
        sector_count: u32,
        buffer: *mut u8,
        write: bool,
        priority: BioRequestPriority,
        on_complete: Option<unsafe fn(*mut BioRequest)>,
    ) -> Self {
        Self {
            disk,
            lba,
            sector_count,
            buffer,
            write,
            priority: AtomicU8::new(priority as u8),
            enqueue_tick: AtomicU64::new(0),
            boost_count: AtomicU8::new(0),
            status: AtomicI8::new(BioStatus::Pending as i8),
            is_aggregate: AtomicBool::new(false),
            next_coalesced: AtomicPtr::new(core::ptr::null_mut()),
            queue_next: AtomicPtr::new(core::ptr::null_mut()),
            on_complete,
        }
    }

    /// Current priority, possibly raised by the anti-starvation boost since
    /// submission.
    #[must_use]
    pub fn priority(&self) -> BioRequestPriority {
        match self.priority.load(Ordering::Acquire) {
            0 => BioRequestPriority::Background,
            1 => BioRequestPriority::Low,
            2 => BioRequestPriority::Medium,
            3 => BioRequestPriority::High,
            _ => BioRequestPriority::Urgent,
        }
    }

    pub(crate) fn set_priority(&self, prio: BioRequestPriority) {
        self.priority.store(prio as u8, Ordering::Release);
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> BioStatus {
        match self.status.load(Ordering::Acquire) {
            0 => BioStatus::Pending,
            1 => BioStatus::Queued,
            2 => BioStatus::Inflight,
            3 => BioStatus::Ok,
            4 => BioStatus::Coalesced,
            -1 => BioStatus::ErrIo,
            -2 => BioStatus::ErrInval,
            -3 => BioStatus::ErrTimeout,
            _ => BioStatus::ErrReadOnly,
        }
    }

    pub(crate) fn set_status(&self, status: BioStatus) {
        self.status.store(status as i8, Ordering::Release);
    }

    /// Whether `status()` is one of the terminal states (`Ok` or an error).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !matches!(self.status(), BioStatus::Pending | BioStatus::Queued | BioStatus::Inflight)
    }

    /// Marks this request (and, if it is a coalesce-chain head, every
    /// request folded into it) complete with `status`, invoking each
    /// member's `on_complete` exactly once.
    ///
    /// Per-member status is `status` for the head and [`BioStatus::Ok`]
    /// dependents unless `status` is an error, in which case every member
    /// fails with the same code: a coalesced read/write is one physical
    /// transfer, so a driver error applies to all of it.
    pub fn complete_chain(&self, status: BioStatus) {
        self.set_status(status);
        self.invoke_callback();

        let mut cursor = self.next_coalesced.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: chain members are linked only while enqueued and are
            // exclusively owned by whichever dispatch completes the chain.
            let member = unsafe { &*cursor };
            member.set_status(status);
            member.invoke_callback();
            cursor = member.next_coalesced.load(Ordering::Acquire);
        }
    }

    fn invoke_callback(&self) {
        if let Some(func) = self.on_complete {
            let self_ptr: *mut BioRequest = core::ptr::from_ref(self).cast_mut();
            // SAFETY: the submitter guarantees `self` outlives completion.
            unsafe { func(self_ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskOps, GenericDiskFlags, GenericDiskType};
    use core::sync::atomic::AtomicU32;

    unsafe fn noop_read(_d: *mut (), _lba: u64, count: u32, _buf: *mut u8) -> Result<u32, hadron_core::error::KernelError> {
        Ok(count)
    }
    unsafe fn noop_write(_d: *mut (), _lba: u64, count: u32, _buf: *const u8) -> Result<u32, hadron_core::error::KernelError> {
        Ok(count)
    }

    static TEST_DISK: GenericDisk = GenericDisk::new(
        "t",
        GenericDiskType::Virtual,
        GenericDiskFlags::empty(),
        512,
        4096,
        core::ptr::null_mut(),
        DiskOps {
            read_sectors: noop_read,
            write_sectors: noop_write,
        },
    );

    static COMPLETIONS: AtomicU32 = AtomicU32::new(0);

    unsafe fn bump(_req: *mut BioRequest) {
        COMPLETIONS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn urgent_priority_is_highest() {
        assert!(BioRequestPriority::Urgent > BioRequestPriority::High);
        assert!(BioRequestPriority::High > BioRequestPriority::Medium);
    }

    #[test]
    fn new_request_starts_pending() {
        let req = BioRequest::new(&TEST_DISK, 0, 1, core::ptr::null_mut(), false, BioRequestPriority::Medium, None);
        assert_eq!(req.status(), BioStatus::Pending);
        assert!(!req.is_complete());
    }

    #[test]
    fn complete_chain_invokes_callback_once_and_marks_terminal() {
        COMPLETIONS.store(0, Ordering::Relaxed);
        let req = BioRequest::new(&TEST_DISK, 0, 1, core::ptr::null_mut(), false, BioRequestPriority::Medium, Some(bump));
        req.complete_chain(BioStatus::Ok);
        assert_eq!(req.status(), BioStatus::Ok);
        assert!(req.is_complete());
        assert_eq!(COMPLETIONS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn complete_chain_completes_every_coalesced_member() {
        COMPLETIONS.store(0, Ordering::Relaxed);
        let head = BioRequest::new(&TEST_DISK, 0, 1, core::ptr::null_mut(), false, BioRequestPriority::Medium, Some(bump));
        let member = BioRequest::new(&TEST_DISK, 1, 1, core::ptr::null_mut(), false, BioRequestPriority::Medium, Some(bump));
        member.is_aggregate.store(true, Ordering::Relaxed);
        head.next_coalesced
            .store(core::ptr::from_ref(&member).cast_mut(), Ordering::Relaxed);

        head.complete_chain(BioStatus::Ok);

        assert_eq!(head.status(), BioStatus::Ok);
        assert_eq!(member.status(), BioStatus::Ok);
        assert_eq!(COMPLETIONS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn error_status_propagates_to_coalesced_members() {
        let head = BioRequest::new(&TEST_DISK, 0, 1, core::ptr::null_mut(), false, BioRequestPriority::Medium, None);
        let member = BioRequest::new(&TEST_DISK, 1, 1, core::ptr::null_mut(), false, BioRequestPriority::Medium, None);
        head.next_coalesced
            .store(core::ptr::from_ref(&member).cast_mut(), Ordering::Relaxed);

        head.complete_chain(BioStatus::ErrIo);

        assert_eq!(head.status(), BioStatus::ErrIo);
        assert_eq!(member.status(), BioStatus::ErrIo);
    }
}
