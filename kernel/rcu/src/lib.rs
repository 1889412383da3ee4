//! Read-copy-update: a global generation counter plus per-generation
//! deferred-callback buckets.
//!
//! A reader brackets a read-side critical section with [`read_lock`] and
//! [`read_unlock`]. A writer that removed a node reachable from readers
//! calls [`defer`] with a caller-owned, intrusively-linked callback instead
//! of freeing it immediately; the callback runs only after every CPU has
//! passed through a quiescent state following the callback's enqueue, which
//! [`synchronize`] (for a blocking wait) or periodic [`maintenance_tick`]
//! calls (for a background sweep) arrange.
//!
//! There is no allocation here: [`RcuCallback`] is meant to be embedded in
//! the structure it will eventually free, the same way the kernel's DPC and
//! APC objects are caller-owned rather than heap-allocated.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use hadron_core::cpu_local::{CpuLocal, MAX_CPUS};
use hadron_core::sync::IrqSpinLock;

/// Number of generation buckets deferred callbacks are binned into.
///
/// Matches the kernel's fixed `RCU_BUCKETS` constant: callbacks enqueued
/// during generation `g` live in bucket `g % RCU_BUCKETS` until a grace
/// period retires that generation.
pub const RCU_BUCKETS: usize = 64;

static GLOBAL_GEN: AtomicU64 = AtomicU64::new(0);

struct CoreState {
    nesting: AtomicU64,
    seen_gen: AtomicU64,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            nesting: AtomicU64::new(0),
            seen_gen: AtomicU64::new(0),
        }
    }
}

static CORE_STATE: CpuLocal<CoreState> =
    CpuLocal::new([const { CoreState::new() }; MAX_CPUS]);

/// Marks entry into an RCU read-side critical section.
///
/// Nests: only the outermost call records a non-quiescent state for the
/// current CPU.
#[inline]
pub fn read_lock() {
    let state = CORE_STATE.get();
    state.nesting.fetch_add(1, Ordering::Relaxed);
}

/// Marks exit from an RCU read-side critical section.
///
/// # Panics
///
/// Panics if called without a matching [`read_lock`].
#[inline]
pub fn read_unlock() {
    let state = CORE_STATE.get();
    let prev = state.nesting.fetch_sub(1, Ordering::Relaxed);
    assert!(prev != 0, "hadron_rcu: read_unlock without matching read_lock");
    if prev == 1 {
        state
            .seen_gen
            .store(GLOBAL_GEN.load(Ordering::Acquire), Ordering::Release);
    }
}

/// Blocks the calling thread until a full grace period has elapsed: every
/// CPU has been observed outside a read-side critical section at or past
/// the generation bumped by this call.
///
/// Spins rather than sleeps; callers above `PASSIVE_LEVEL` or inside an
/// interrupt handler must not call this.
pub fn synchronize() {
    let target = GLOBAL_GEN.fetch_add(1, Ordering::AcqRel) + 1;
    wait_for_generation(target);
}

fn wait_for_generation(target: u64) {
    loop {
        let mut all_seen = true;
        for cpu in 0..active_cpu_count() {
            let seen = CORE_STATE.get_for(cpu).seen_gen.load(Ordering::Acquire);
            if seen < target {
                all_seen = false;
                break;
            }
        }
        if all_seen {
            return;
        }
        core::hint::spin_loop();
    }
}

static ONLINE_CPUS: AtomicU32 = AtomicU32::new(1);

/// Publishes the number of CPUs participating in grace-period tracking.
///
/// Mirrors the original kernel's `global.core_count`: a fixed count set once
/// by MP bring-up before any core starts taking the scheduler live, and read
/// thereafter by every [`synchronize`] call. Must be called exactly once,
/// after topology discovery has enumerated every core that will ever call
/// [`read_lock`]/[`read_unlock`], and before any [`synchronize`] call that
/// must wait on more than the boot CPU.
///
/// # Panics
///
/// Panics if called more than once, or with `count == 0`.
pub fn set_online_cpu_count(count: u32) {
    assert!(count != 0, "hadron_rcu: online CPU count must be nonzero");
    let prev = ONLINE_CPUS.swap(count, Ordering::AcqRel);
    assert!(
        prev == 1,
        "hadron_rcu: set_online_cpu_count() called more than once"
    );
}

/// Number of CPUs participating in grace-period tracking.
///
/// Defaults to 1 (the boot CPU) until [`set_online_cpu_count`] publishes the
/// real topology; a CPU that never calls [`read_lock`]/[`read_unlock`]
/// trivially stays at `seen_gen = 0`, which would otherwise stall every
/// [`synchronize`] forever, so this count must track exactly the CPUs that
/// are live and participating.
fn active_cpu_count() -> u32 {
    ONLINE_CPUS.load(Ordering::Acquire)
}

/// A caller-owned node linking a deferred callback into its generation bucket.
///
/// Embed this in the structure being reclaimed, the same way intrusive list
/// nodes are embedded elsewhere in the kernel. Must not be moved or dropped
/// while enqueued.
pub struct RcuCallback {
    next: AtomicPtr<RcuCallback>,
    enqueued: AtomicBool,
    func: Option<unsafe fn(*mut RcuCallback)>,
    gen_when_called: u64,
}

// SAFETY: ownership transfers to the bucket lists under their locks; the
// caller guarantees the pointee outlives the deferred call.
unsafe impl Send for RcuCallback {}
unsafe impl Sync for RcuCallback {}

impl RcuCallback {
    /// Creates an unqueued callback node.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
            enqueued: AtomicBool::new(false),
            func: None,
            gen_when_called: 0,
        }
    }
}

impl Default for RcuCallback {
    fn default() -> Self {
        Self::new()
    }
}

struct Bucket {
    lock: IrqSpinLock<()>,
    head: AtomicPtr<RcuCallback>,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            lock: IrqSpinLock::new(()),
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

static BUCKETS: [Bucket; RCU_BUCKETS] = [const { Bucket::new() }; RCU_BUCKETS];

/// Defers `func(cb)` until every CPU has passed through a quiescent state
/// after this call.
///
/// `cb` must not already be enqueued; enqueuing an already-enqueued callback
/// is a logic error and panics rather than corrupting the bucket list.
///
/// # Safety
///
/// `cb` must remain valid (not freed or moved) until `func` runs. The
/// callback is invoked with interrupts enabled from maintenance context,
/// never from the caller's own stack.
pub unsafe fn defer(cb: &'static mut RcuCallback, func: unsafe fn(*mut RcuCallback)) {
    assert!(
        !cb.enqueued.swap(true, Ordering::AcqRel),
        "hadron_rcu: defer() on an already-enqueued callback"
    );
    let gen = GLOBAL_GEN.load(Ordering::Acquire);
    cb.gen_when_called = gen;
    cb.func = Some(func);

    let bucket = &BUCKETS[(gen as usize) % RCU_BUCKETS];
    let guard = bucket.lock.lock();
    let cb_ptr: *mut RcuCallback = cb;
    let old_head = bucket.head.load(Ordering::Relaxed);
    // SAFETY: `cb_ptr` was just marked enqueued above and is exclusively
    // owned by this list until drained.
    unsafe { (*cb_ptr).next.store(old_head, Ordering::Relaxed) };
    bucket.head.store(cb_ptr, Ordering::Release);
    drop(guard);
}

fn drain_bucket(index: usize) {
    let bucket = &BUCKETS[index];
    let guard = bucket.lock.lock();
    let head = bucket.head.swap(core::ptr::null_mut(), Ordering::AcqRel);
    drop(guard);

    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: nodes in this bucket were enqueued by `defer` and are not
        // touched anywhere else until this drain.
        let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
        // SAFETY: the enqueuer guaranteed `cb` stays valid until its
        // callback runs, which is now.
        unsafe {
            (*cursor).enqueued.store(false, Ordering::Release);
            if let Some(func) = (*cursor).func {
                func(cursor);
            }
        }
        cursor = next;
    }
}

/// Periodic maintenance: advances the grace period and drains retired
/// buckets when no new generation was requested since the last tick.
///
/// Call this from a low-priority periodic context (never from an interrupt
/// handler). Mirrors the kernel's self-throttling behavior: if the
/// generation has moved since the last tick, some other caller already
/// triggered a grace period and this tick does nothing; otherwise it
/// triggers one itself.
pub fn maintenance_tick() {
    static LAST_GEN: AtomicU64 = AtomicU64::new(u64::MAX);

    let gen = GLOBAL_GEN.load(Ordering::Acquire);
    let last = LAST_GEN.swap(gen, Ordering::AcqRel);
    if last != gen {
        return;
    }

    synchronize();
    let retired_gen = GLOBAL_GEN.load(Ordering::Acquire) - 1;
    drain_bucket((retired_gen as usize) % RCU_BUCKETS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn read_lock_unlock_nests() {
        read_lock();
        read_lock();
        read_unlock();
        read_unlock();
    }

    #[test]
    #[should_panic(expected = "without matching read_lock")]
    fn unmatched_read_unlock_panics() {
        read_unlock();
    }

    #[test]
    fn synchronize_returns_immediately_with_no_readers() {
        synchronize();
    }

    static RAN: AtomicUsize = AtomicUsize::new(0);

    unsafe fn record_call(_cb: *mut RcuCallback) {
        RAN.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn defer_runs_after_synchronize() {
        static mut CB: RcuCallback = RcuCallback::new();
        RAN.store(0, Ordering::Relaxed);

        // SAFETY: single-threaded test, no concurrent access to CB.
        unsafe {
            #[allow(static_mut_refs)]
            defer(&mut *core::ptr::addr_of_mut!(CB), record_call);
        }
        synchronize();
        drain_bucket((GLOBAL_GEN.load(Ordering::Acquire) as usize) % RCU_BUCKETS);

        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn online_cpu_count_defaults_to_one() {
        assert_eq!(active_cpu_count(), 1);
    }

    #[test]
    #[should_panic(expected = "nonzero")]
    fn online_cpu_count_rejects_zero() {
        set_online_cpu_count(0);
    }

    #[test]
    #[should_panic(expected = "already-enqueued")]
    fn double_defer_panics() {
        static mut CB: RcuCallback = RcuCallback::new();
        // SAFETY: single-threaded test.
        unsafe {
            #[allow(static_mut_refs)]
            defer(&mut *core::ptr::addr_of_mut!(CB), record_call);
            #[allow(static_mut_refs)]
            defer(&mut *core::ptr::addr_of_mut!(CB), record_call);
        }
    }
}
