//! The reaper: a dedicated low-priority thread that finalizes `Zombie`
//! threads once nothing else still references them.
//!
//! A thread transitions to `Zombie` when it finishes running but before its
//! stack and descriptor storage can be released — other code (a `join`
//! caller, a debugger) may still hold a reference. The reaper waits for the
//! reference count to drop to zero before calling the registered finalizer
//! and marking the thread `Terminated`.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::sync::condvar::Condvar;
use crate::sync::mutex::Mutex;
use crate::thread::{Thread, ThreadState};

/// Per-thread reference count, finalizer, and reaper-queue link, embedded
/// by the owning subsystem alongside its [`Thread`].
pub struct ReapInfo {
    thread: &'static Thread,
    refcount: AtomicU32,
    finalize: Option<unsafe fn(&'static Thread)>,
    next: AtomicPtr<ReapInfo>,
}

impl ReapInfo {
    /// Creates reap bookkeeping for a thread that is not yet a zombie, with
    /// a starting reference count of 1 (the thread's own slot).
    #[must_use]
    pub const fn new(thread: &'static Thread, finalize: Option<unsafe fn(&'static Thread)>) -> Self {
        Self {
            thread,
            refcount: AtomicU32::new(1),
            finalize,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Increments the reference count, e.g. when a `join` caller starts
    /// waiting on this thread.
    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reference count. Returns the count after decrementing.
    pub fn release(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

static QUEUE_LOCK: Mutex<()> = Mutex::new(());
static QUEUE_HEAD: AtomicPtr<ReapInfo> = AtomicPtr::new(core::ptr::null_mut());
static QUEUE_NONEMPTY: Condvar = Condvar::new();

/// Marks the thread behind `info` as finished and enqueues it for the
/// reaper.
///
/// # Safety
///
/// `info` must be `'static` and must not already be enqueued.
pub unsafe fn retire(info: &'static ReapInfo) {
    info.thread.set_state(ThreadState::Zombie);
    let guard = QUEUE_LOCK.lock();
    info.next
        .store(QUEUE_HEAD.load(Ordering::Relaxed), Ordering::Relaxed);
    QUEUE_HEAD.store(core::ptr::from_ref(info).cast_mut(), Ordering::Relaxed);
    drop(guard);
    QUEUE_NONEMPTY.notify_one();
}

/// The reaper thread's body: an infinite loop that waits for zombies, then
/// for their refcount to drain, then finalizes and terminates them.
///
/// Intended to run as a dedicated [`crate::thread::PriorityClass::Background`]
/// thread created once during scheduler bring-up; never returns.
pub fn run() -> ! {
    loop {
        reap_one();
    }
}

/// Processes one pass over the zombie queue: pops the whole list, finalizes
/// every entry whose refcount has drained to zero, and relinks the rest for
/// a later pass. Blocks on [`QUEUE_NONEMPTY`] if the queue was empty or
/// every entry was still referenced.
///
/// Split out from [`run`] so tests can drive a single pass without an
/// infinite loop.
fn reap_one() {
    let mut guard = QUEUE_LOCK.lock();
    let mut cursor = QUEUE_HEAD.swap(core::ptr::null_mut(), Ordering::AcqRel);
    drop(guard);

    let mut finalized_any = false;
    let mut still_pending: *mut ReapInfo = core::ptr::null_mut();

    while !cursor.is_null() {
        // SAFETY: `cursor` was linked by `retire` as a live `'static`
        // reference; the list was just exclusively taken above.
        let info = unsafe { &*cursor };
        let next = info.next.load(Ordering::Relaxed);

        if info.refcount.load(Ordering::Acquire) == 0 {
            if let Some(finalize) = info.finalize {
                // SAFETY: caller-provided finalizer for a thread whose
                // refcount has reached zero, meaning no other code still
                // references it.
                unsafe { finalize(info.thread) };
            }
            info.thread.set_state(ThreadState::Terminated);
            finalized_any = true;
        } else {
            info.next.store(still_pending, Ordering::Relaxed);
            still_pending = cursor;
        }

        cursor = next;
    }

    if !still_pending.is_null() {
        guard = QUEUE_LOCK.lock();
        let mut tail = still_pending;
        // SAFETY: walking the locally-built `still_pending` list.
        while unsafe { !(*tail).next.load(Ordering::Relaxed).is_null() } {
            tail = unsafe { (*tail).next.load(Ordering::Relaxed) };
        }
        unsafe { (*tail).next.store(QUEUE_HEAD.load(Ordering::Relaxed), Ordering::Relaxed) };
        QUEUE_HEAD.store(still_pending, Ordering::Relaxed);
        drop(guard);
    }

    if !finalized_any {
        let guard = QUEUE_LOCK.lock();
        if QUEUE_HEAD.load(Ordering::Acquire).is_null() {
            let _ = QUEUE_NONEMPTY.wait(guard, &QUEUE_LOCK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::PriorityClass;

    #[test]
    fn reap_info_tracks_refcount() {
        let thread = Box::leak(Box::new(Thread::new(PriorityClass::Background)));
        let info = ReapInfo::new(thread, None);
        info.acquire();
        assert_eq!(info.release(), 1);
        assert_eq!(info.release(), 0);
    }

    #[test]
    fn retire_marks_zombie_and_enqueues() {
        let thread = Box::leak(Box::new(Thread::new(PriorityClass::Background)));
        let info = Box::leak(Box::new(ReapInfo::new(thread, None)));
        info.release();
        unsafe { retire(info) };
        assert_eq!(thread.state(), ThreadState::Zombie);
        assert!(!QUEUE_HEAD.load(Ordering::Relaxed).is_null());
    }
}
