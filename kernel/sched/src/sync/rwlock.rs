//! A thread-blocking reader/writer lock backed by a turnstile.
//!
//! Encodes state as two small fields rather than the single pointer
//! [`crate::sync::Mutex`] uses: a writer-owner pointer (null when not
//! write-held) and a reader count. A waiting writer does not starve behind
//! a steady stream of readers — once a writer has blocked, new readers are
//! turned away until it acquires, mirrored by the `writer_wanted` flag.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::thread::Thread;
use crate::turnstile::{self, QueueSide};

const NO_THREAD_SENTINEL: *mut Thread = core::ptr::without_provenance_mut(1);

/// A thread-blocking reader/writer lock.
pub struct RwLock<T> {
    writer: AtomicPtr<Thread>,
    readers: AtomicU32,
    writer_wanted: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: `writer`/`readers` gate all access to `data`; `T: Send + Sync` is
// required for the usual shared/exclusive reasons.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            writer: AtomicPtr::new(core::ptr::null_mut()),
            readers: AtomicU32::new(0),
            writer_wanted: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    fn lock_word(&self) -> *const () {
        core::ptr::from_ref(&self.writer).cast::<()>()
    }

    /// Attempts to acquire a shared (read) lock without blocking.
    ///
    /// Fails if a writer holds the lock or one is waiting, so a steady
    /// stream of readers cannot starve a blocked writer.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.writer_wanted.load(Ordering::Acquire) {
            return None;
        }
        if !self.writer.load(Ordering::Acquire).is_null() {
            return None;
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        // Re-check: a writer may have acquired between our loads above and
        // the increment.
        if !self.writer.load(Ordering::Acquire).is_null() {
            self.readers.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(RwLockReadGuard { lock: self })
    }

    /// Attempts to acquire exclusive (write) access without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self.readers.load(Ordering::Acquire) != 0 {
            return None;
        }
        let current_ptr: *mut Thread = crate::sched::current()
            .map_or(NO_THREAD_SENTINEL, |t| core::ptr::from_ref(t).cast_mut());
        if self
            .writer
            .compare_exchange(ptr::null_mut(), current_ptr, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            if self.readers.load(Ordering::Acquire) != 0 {
                self.writer.store(ptr::null_mut(), Ordering::Release);
                return None;
            }
            Some(RwLockWriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquires a shared lock, blocking on contention.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            self.block_on(QueueSide::Reader);
        }
    }

    /// Acquires exclusive access, blocking on contention.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.writer_wanted.store(true, Ordering::Release);
        loop {
            if let Some(guard) = self.try_write() {
                self.writer_wanted.store(false, Ordering::Release);
                return guard;
            }
            self.block_on(QueueSide::Writer);
        }
    }

    fn block_on(&self, side: QueueSide) {
        let owner_ptr = self.writer.load(Ordering::Acquire);
        if owner_ptr.is_null() || owner_ptr == NO_THREAD_SENTINEL {
            core::hint::spin_loop();
            return;
        }
        let Some(current) = crate::sched::current() else {
            core::hint::spin_loop();
            return;
        };
        // SAFETY: `owner_ptr` is a live `'static` thread recorded by a
        // successful `try_write`.
        let owner = unsafe { &*owner_ptr };
        // SAFETY: both references are `'static` kernel thread objects.
        unsafe { turnstile::block(self.lock_word(), side, current, owner) };
    }
}

/// RAII guard granting shared access to an [`RwLock`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees no writer exists while it's held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            turnstile::wake_one(self.lock.lock_word(), QueueSide::Writer);
        }
    }
}

/// RAII guard granting exclusive access to an [`RwLock`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see above.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.writer.store(ptr::null_mut(), Ordering::Release);
        // Prefer waking a waiting writer over a reader: readers would
        // otherwise flood in ahead of a writer that has already been
        // waiting, since `try_read` only checks `writer_wanted` at entry.
        if turnstile::wake_one(self.lock.lock_word(), QueueSide::Writer).is_none() {
            turnstile::wake_all(self.lock.lock_word(), QueueSide::Reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers_allowed() {
        let lock = RwLock::new(7);
        let a = lock.try_read().unwrap();
        let b = lock.try_read().unwrap();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new(0);
        let _w = lock.try_write().unwrap();
        assert!(lock.try_read().is_none());
    }

    #[test]
    fn reader_excludes_writer() {
        let lock = RwLock::new(0);
        let _r = lock.try_read().unwrap();
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn write_then_read_after_drop() {
        let lock = RwLock::new(0);
        {
            let mut w = lock.try_write().unwrap();
            *w = 5;
        }
        let r = lock.try_read().unwrap();
        assert_eq!(*r, 5);
    }
}
