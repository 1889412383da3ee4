//! Thread object and its state machine.

use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crate::apc::Apc;

/// A thread's scheduling priority class.
///
/// Ordered from least to most eager to run; [`PriorityClass::Urgent`]
/// preempts everything and never surrenders to a quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PriorityClass {
    /// Runs only when every other queue on this CPU is empty.
    Background = 0,
    /// Timesharing: MLFQ-style virtual-runtime fairness.
    Timeshare = 1,
    /// Real-time: FIFO within class, preempts Timeshare/Background.
    Rt = 2,
    /// Preempts everything; no quantum.
    Urgent = 3,
}

/// A thread's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// The per-CPU idle thread specifically.
    IdleThread,
    /// Runnable, waiting for a CPU.
    Ready,
    /// Currently executing on some CPU.
    Running,
    /// Blocked on a lock or turnstile.
    Blocked,
    /// Blocked in a timed sleep.
    Sleeping,
    /// Finished running, not yet reaped.
    Zombie,
    /// Reaped; storage may be released.
    Terminated,
    /// Manually suspended; resumes to [`ThreadState::Ready`].
    Halted,
}

/// Whether a blocked wait can be interrupted by something other than its
/// designated wake source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitType {
    /// Not currently waiting.
    None,
    /// May be woken early.
    Interruptible,
    /// May only be woken by its wake source.
    Uninterruptible,
}

/// Why a condition-variable-style wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    /// No reason recorded (wait still pending).
    None = 0,
    /// Woken by `signal`/`broadcast`.
    Signal = 1,
    /// Woken because the wait's deadline elapsed.
    Timeout = 2,
}

bitflags::bitflags! {
    /// Per-thread scheduling flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Excluded from work-stealing migration.
        const NO_STEAL = 1 << 0;
    }
}

/// A monotonic cookie identifying one specific wait attempt.
///
/// Incremented each time a thread begins a new timed wait. A timeout
/// callback scheduled for an earlier wait compares its captured cookie
/// against the thread's current one before waking it, so a wait that
/// already completed (signal beat the clock) ignores a stale timer fire.
#[derive(Debug, Default)]
pub struct WaitCookie(AtomicU64);

impl WaitCookie {
    /// Creates a cookie starting at generation 0.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Begins a new wait, returning the cookie value to capture for a
    /// matching timeout callback.
    pub fn begin(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns whether `captured` is still the current generation.
    #[must_use]
    pub fn is_current(&self, captured: u64) -> bool {
        self.0.load(Ordering::Acquire) == captured
    }
}

/// A kernel thread.
///
/// Caller-owned: threads are not allocated by this crate. Embed a `Thread`
/// in whatever storage the owning subsystem manages (a static for the idle
/// thread, a slab-allocated object for dynamically created threads) and
/// hand a `'static` reference to the scheduler.
pub struct Thread {
    /// Scheduling priority class. Fixed at creation except for priority
    /// inheritance boosts applied by a turnstile.
    pub prio_class: PriorityClass,
    /// Effective priority within the class, possibly boosted.
    pub effective_prio: AtomicU8,
    state: AtomicU8,
    wait_type: AtomicU8,
    /// Flags controlling migration eligibility.
    pub flags: ThreadFlags,
    /// CPU this thread is bound to, or `None` if migratable.
    pub bound_cpu: Option<u32>,
    /// Monotonic wait-cookie for cancellable timed waits.
    pub wait_cookie: WaitCookie,
    /// Accumulated virtual runtime, used by the Timeshare class's fairness
    /// ordering. Billed in TSC ticks converted through a nice-indexed weight.
    pub vruntime: AtomicU64,
    /// Niceness, indexing the CFS-style weight table used to convert billed
    /// wall-clock ticks into virtual runtime and to size a thread's epoch
    /// quantum. Clamped to `-20..=19`; 0 is the default weight.
    pub nice: i8,
    /// Intrusive run-queue link, owned by whichever queue currently holds
    /// this thread.
    pub queue_next: core::sync::atomic::AtomicPtr<Thread>,
    /// Intrusive wait-queue link, owned by whichever turnstile or condvar
    /// this thread is currently blocked on.
    pub wait_next: core::sync::atomic::AtomicPtr<Thread>,
    /// Key this thread was inserted into a vruntime tree under. Fixed for
    /// the duration the thread is in the tree; CLRS-style RB-tree
    /// invariants require the key not change while the node is linked.
    pub(crate) rb_key: AtomicU64,
    pub(crate) rb_left: core::sync::atomic::AtomicPtr<Thread>,
    pub(crate) rb_right: core::sync::atomic::AtomicPtr<Thread>,
    pub(crate) rb_parent: core::sync::atomic::AtomicPtr<Thread>,
    /// `true` if red, `false` if black.
    pub(crate) rb_red: core::sync::atomic::AtomicBool,
    /// Ticks remaining in the current TIMESHARE epoch quantum. Set on
    /// dispatch, decremented by the scheduler tick.
    pub(crate) quantum_remaining: AtomicU64,
    /// Set by the scheduler tick once `quantum_remaining` reaches zero;
    /// consumed by `requeue` to route the thread into the completed tree
    /// instead of the active one.
    pub(crate) quantum_exhausted: core::sync::atomic::AtomicBool,
    /// Pending-APC list heads, one per [`crate::apc::ApcKind`], owned by this
    /// thread. Queued APCs target the thread they run on, not a CPU: a
    /// thread carries its own pending work across migrations.
    pub(crate) apc_heads: [AtomicPtr<Apc>; 3],
    /// Bitmask of `apc_heads` indices with at least one queued APC.
    pub(crate) apc_mask: AtomicU8,
}

impl Thread {
    /// Creates a new thread descriptor in the `Ready` state.
    #[must_use]
    pub const fn new(prio_class: PriorityClass) -> Self {
        Self {
            prio_class,
            effective_prio: AtomicU8::new(prio_class as u8),
            state: AtomicU8::new(ThreadState::Ready as u8),
            wait_type: AtomicU8::new(WaitType::None as u8),
            flags: ThreadFlags::empty(),
            bound_cpu: None,
            wait_cookie: WaitCookie::new(),
            vruntime: AtomicU64::new(0),
            nice: 0,
            queue_next: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            wait_next: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            rb_key: AtomicU64::new(0),
            rb_left: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            rb_right: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            rb_parent: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            rb_red: core::sync::atomic::AtomicBool::new(false),
            quantum_remaining: AtomicU64::new(0),
            quantum_exhausted: core::sync::atomic::AtomicBool::new(false),
            apc_heads: [
                AtomicPtr::new(core::ptr::null_mut()),
                AtomicPtr::new(core::ptr::null_mut()),
                AtomicPtr::new(core::ptr::null_mut()),
            ],
            apc_mask: AtomicU8::new(0),
        }
    }

    /// Sets this thread's niceness, clamping to the supported `-20..=19`
    /// range.
    pub fn set_nice(&mut self, nice: i8) {
        self.nice = nice.clamp(-20, 19);
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::IdleThread,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Blocked,
            4 => ThreadState::Sleeping,
            5 => ThreadState::Zombie,
            6 => ThreadState::Terminated,
            _ => ThreadState::Halted,
        }
    }

    /// Forces a state transition.
    ///
    /// The legality of a given transition (e.g. `Blocked` -> `Running`
    /// without passing through `Ready`) is the scheduler's responsibility;
    /// this setter itself is unconditional.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns the current wait-interruptibility.
    #[must_use]
    pub fn wait_type(&self) -> WaitType {
        match self.wait_type.load(Ordering::Acquire) {
            0 => WaitType::None,
            1 => WaitType::Interruptible,
            _ => WaitType::Uninterruptible,
        }
    }

    /// Sets the wait-interruptibility, used when entering/leaving a block.
    pub fn set_wait_type(&self, wait_type: WaitType) {
        self.wait_type.store(wait_type as u8, Ordering::Release);
    }

    /// Returns the effective (possibly PI-boosted) priority class ordinal.
    #[must_use]
    pub fn effective_priority(&self) -> u8 {
        self.effective_prio.load(Ordering::Acquire)
    }

    /// Boosts the effective priority to at least `floor`, for priority
    /// inheritance. Never lowers it.
    pub fn boost_to(&self, floor: u8) {
        self.effective_prio.fetch_max(floor, Ordering::AcqRel);
    }

    /// Reverts any priority-inheritance boost, restoring the thread's base
    /// class priority.
    pub fn revert_boost(&self) {
        self.effective_prio
            .store(self.prio_class as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_starts_ready() {
        let t = Thread::new(PriorityClass::Timeshare);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.wait_type(), WaitType::None);
    }

    #[test]
    fn boost_raises_but_never_lowers() {
        let t = Thread::new(PriorityClass::Background);
        t.boost_to(PriorityClass::Urgent as u8);
        assert_eq!(t.effective_priority(), PriorityClass::Urgent as u8);
        t.boost_to(PriorityClass::Timeshare as u8);
        assert_eq!(t.effective_priority(), PriorityClass::Urgent as u8);
        t.revert_boost();
        assert_eq!(t.effective_priority(), PriorityClass::Background as u8);
    }

    #[test]
    fn wait_cookie_detects_staleness() {
        let cookie = WaitCookie::new();
        let captured = cookie.begin();
        assert!(cookie.is_current(captured));
        let _ = cookie.begin();
        assert!(!cookie.is_current(captured));
    }
}
