//! A thread-blocking mutual exclusion lock backed by a turnstile.
//!
//! Unlike [`hadron_core::sync::SpinLock`], contention here blocks the
//! calling thread instead of spinning, and propagates priority inheritance
//! through the owning thread's turnstile.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::thread::Thread;
use crate::turnstile::{self, QueueSide};

/// Ownership marker used when there is no current [`Thread`] (early boot,
/// or host unit tests). Never dereferenced.
const NO_THREAD_SENTINEL: *mut Thread = core::ptr::without_provenance_mut(1);

/// A thread-blocking mutual exclusion lock.
///
/// Encodes ownership as a single pointer-sized word: null means free,
/// non-null is the owning [`Thread`]. Const-constructable for `static` use.
pub struct Mutex<T> {
    owner: AtomicPtr<Thread>,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive access to `T` is guaranteed by `owner` acting as the
// lock word; `T: Send` because the data crosses threads.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicPtr::new(core::ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    fn lock_word(&self) -> *const () {
        core::ptr::from_ref(&self.owner).cast::<()>()
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Usable before scheduler bring-up (or on the host test harness, where
    /// there is no current thread at all): in that case ownership is
    /// recorded against a fixed non-null sentinel rather than a real
    /// thread, which is enough to exclude other callers but cannot
    /// participate in priority inheritance.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let current_ptr: *mut Thread = crate::sched::current()
            .map_or(NO_THREAD_SENTINEL, |t| core::ptr::from_ref(t).cast_mut());
        if self
            .owner
            .compare_exchange(ptr::null_mut(), current_ptr, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Acquires the lock, blocking the calling thread on contention.
    ///
    /// # Panics
    ///
    /// Panics if called before the scheduler has a current thread (i.e.
    /// before the first [`crate::sched::yield_now`]/thread bring-up).
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            let owner_ptr = self.owner.load(Ordering::Acquire);
            if owner_ptr.is_null() || owner_ptr == NO_THREAD_SENTINEL {
                // Either freed between our failed CAS and this read, or held
                // by a sentinel (non-scheduled) owner we cannot block against
                // via a turnstile. Spin instead.
                core::hint::spin_loop();
                continue;
            }

            let Some(current) = crate::sched::current() else {
                core::hint::spin_loop();
                continue;
            };
            // SAFETY: a non-sentinel non-null owner was stored by a
            // successful try_lock/CAS above and the owning thread remains
            // valid while it holds the lock.
            let owner = unsafe { &*owner_ptr };

            // SAFETY: both references are `'static` kernel thread objects
            // per this crate's ownership contract.
            unsafe { turnstile::block(self.lock_word(), QueueSide::Writer, current, owner) };
        }
    }
}

/// RAII guard that releases the [`Mutex`] when dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.owner.store(ptr::null_mut(), Ordering::Release);
        turnstile::wake_one(self.mutex.lock_word(), QueueSide::Writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_succeeds_when_free() {
        let mutex = Mutex::new(42);
        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert_eq!(*guard.unwrap(), 42);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let mutex = Mutex::new(0);
        let _guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        let mutex = Mutex::new(0);
        {
            let mut guard = mutex.try_lock().unwrap();
            *guard = 99;
        }
        let guard = mutex.try_lock().unwrap();
        assert_eq!(*guard, 99);
    }
}
