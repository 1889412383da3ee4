//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(hadron_lockdep)]
use super::lockdep::LockClassId;

#[cfg(hadron_lock_debug)]
use crate::cpu_local::{CpuLocal, MAX_CPUS};

/// Sentinel meaning "no declared lock-ordering level".
const NO_LEVEL: u8 = u8::MAX;

/// Per-CPU highest lock-ordering level currently held, for
/// [`SpinLock::leveled`] locks.
///
/// Acquiring a leveled lock with a level ≤ the highest already held is a
/// lock-ordering violation: it means two call sites can take the same pair
/// of locks in opposite order, which is how ABBA deadlocks happen. This is
/// a cheaper, static-ordering-only complement to the full lockdep graph.
#[cfg(hadron_lock_debug)]
static HELD_LEVEL: CpuLocal<core::sync::atomic::AtomicU8> =
    CpuLocal::new([const { core::sync::atomic::AtomicU8::new(NO_LEVEL) }; MAX_CPUS]);

/// A spin-based mutual exclusion lock.
///
/// Uses test-and-test-and-set (TTAS) to reduce cache-line contention.
/// Const-constructable so it can be placed in `static` items.
pub struct SpinLock<T> {
    locked: AtomicBool,
    #[cfg(hadron_lockdep)]
    name: &'static str,
    /// Lock-ordering level set by [`SpinLock::leveled`], or [`NO_LEVEL`].
    level: u8,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(hadron_lockdep)]
            name: "<unnamed>",
            level: NO_LEVEL,
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a new unlocked `SpinLock` with a name for lockdep diagnostics.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(hadron_lockdep)]
            name,
            level: NO_LEVEL,
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a new unlocked, named `SpinLock` that declares its place in
    /// the global lock-ordering hierarchy.
    ///
    /// `level` is a small integer fixed by convention for each well-known
    /// global lock (e.g. the PMM lock is level 3). Under
    /// `cfg(hadron_lock_debug)`, acquiring a leveled lock asserts that no
    /// lock at the same or a higher level is already held on this CPU —
    /// catching inconsistent acquisition order before it can deadlock.
    pub const fn leveled(name: &'static str, level: u8, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(hadron_lockdep)]
            name,
            level,
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock when dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        #[cfg(hadron_lock_debug)]
        {
            if super::irq_spinlock::irq_lock_depth() != 0 {
                panic!("SpinLock::lock() called while holding IrqSpinLock");
            }
        }
        #[cfg(hadron_lock_debug)]
        let prev_level = self.check_level_on_acquire();

        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                #[cfg(hadron_lockdep)]
                let class = self.lockdep_acquire();

                return SpinLockGuard {
                    lock: self,
                    #[cfg(hadron_lockdep)]
                    class,
                    #[cfg(hadron_lock_debug)]
                    prev_level,
                };
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Asserts (and records) the lock-ordering level of `self` against the
    /// level currently held by this CPU, if any. Returns the prior level,
    /// to be restored by the guard on release.
    #[cfg(hadron_lock_debug)]
    fn check_level_on_acquire(&self) -> u8 {
        if self.level == NO_LEVEL {
            return NO_LEVEL;
        }
        let held = HELD_LEVEL.get();
        let prev = held.load(Ordering::Relaxed);
        if prev != NO_LEVEL && prev >= self.level {
            panic!(
                "SpinLock lock-ordering violation: acquiring level {} while holding level {}",
                self.level, prev
            );
        }
        held.store(self.level, Ordering::Relaxed);
        prev
    }

    /// Restores the per-CPU held level to `prev`, undoing
    /// [`check_level_on_acquire`](Self::check_level_on_acquire).
    #[cfg(hadron_lock_debug)]
    fn restore_level_on_release(&self, prev: u8) {
        if self.level == NO_LEVEL {
            return;
        }
        HELD_LEVEL.get().store(prev, Ordering::Relaxed);
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it was already held.
    /// Useful in panic handlers where blocking would risk deadlock.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            #[cfg(hadron_lockdep)]
            let class = self.lockdep_acquire();
            #[cfg(hadron_lock_debug)]
            let prev_level = self.check_level_on_acquire();

            Some(SpinLockGuard {
                lock: self,
                #[cfg(hadron_lockdep)]
                class,
                #[cfg(hadron_lock_debug)]
                prev_level,
            })
        } else {
            None
        }
    }

    /// Acquires the lock without the IRQ-context assertion.
    ///
    /// Only for locks known-safe to hold with interrupts disabled â€” specifically
    /// the heap allocator, which may be entered from any context including
    /// `IrqSpinLock` critical sections that allocate.
    pub fn lock_unchecked(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard {
                    lock: self,
                    #[cfg(hadron_lockdep)]
                    class: LockClassId::NONE,
                    #[cfg(hadron_lock_debug)]
                    prev_level: NO_LEVEL,
                };
            }

            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Returns a mutable reference to the underlying data without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the data.
    /// Intended as a last-resort escape hatch (e.g., panic handler on a uniprocessor).
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Registers this lock with lockdep and records the acquisition.
    #[cfg(hadron_lockdep)]
    fn lockdep_acquire(&self) -> LockClassId {
        let class = super::lockdep::get_or_register(
            self as *const _ as usize,
            self.name,
            super::lockdep::LockKind::SpinLock,
        );
        super::lockdep::lock_acquired(class);
        class
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    #[cfg(hadron_lockdep)]
    class: LockClassId,
    /// The level held by this CPU before this lock was acquired, restored
    /// on release so nested leveled locks unwind correctly.
    #[cfg(hadron_lock_debug)]
    prev_level: u8,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Returns a reference to the underlying [`SpinLock`].
    ///
    /// Used to re-acquire after a condition-variable-style release.
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);

        #[cfg(hadron_lockdep)]
        if self.class != LockClassId::NONE {
            super::lockdep::lock_released(self.class);
        }
        #[cfg(hadron_lock_debug)]
        self.lock.restore_level_on_release(self.prev_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        // Lock is released after guard is dropped.
        let guard = lock.try_lock();
        assert!(guard.is_some());
    }

    #[test]
    fn try_lock_succeeds_when_free() {
        let lock = SpinLock::new(10);
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert_eq!(*guard.unwrap(), 10);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(10);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        let guard = lock.lock();
        assert_eq!(*guard, 99);
    }

    #[test]
    fn lock_reentrant_after_drop() {
        let lock = SpinLock::new(42);
        {
            let _guard = lock.lock();
        }
        // After guard is dropped, we should be able to lock again.
        {
            let _guard = lock.lock();
        }
        // And try_lock should also work.
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn deref_and_deref_mut() {
        let lock = SpinLock::new(String::from("hello"));
        {
            let guard = lock.lock();
            // Deref: read access
            assert_eq!(guard.len(), 5);
        }
        {
            let mut guard = lock.lock();
            // DerefMut: write access
            guard.push_str(" world");
        }
        let guard = lock.lock();
        assert_eq!(&*guard, "hello world");
    }

    #[test]
    fn named_constructor() {
        let lock = SpinLock::named("test_lock", 42);
        let guard = lock.lock();
        assert_eq!(*guard, 42);
    }

    #[test]
    fn leveled_constructor_behaves_like_a_plain_lock() {
        let lock = SpinLock::leveled("pmm", 3, 7);
        let guard = lock.lock();
        assert_eq!(*guard, 7);
    }
}
