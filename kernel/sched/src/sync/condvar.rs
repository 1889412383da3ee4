//! A condition variable: a wait queue associated with, but not embedding,
//! an external lock.
//!
//! Unlike [`crate::sync::Mutex`]/[`crate::sync::RwLock`], a condvar has no
//! "owner" to propagate priority inheritance to — callers park here only
//! while already holding some other lock, which is released for the
//! duration of the wait and reacquired before returning.

use core::sync::atomic::{AtomicPtr, Ordering};

use hadron_core::sync::IrqSpinLock;

use crate::sync::mutex::{Mutex, MutexGuard};
use crate::thread::{Thread, ThreadState, WakeReason};

struct WaitList {
    head: AtomicPtr<Thread>,
}

impl WaitList {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn push_back(&mut self, thread: &'static Thread) {
        let ptr: *mut Thread = core::ptr::from_ref(thread).cast_mut();
        thread.wait_next.store(core::ptr::null_mut(), Ordering::Relaxed);
        if self.head.load(Ordering::Relaxed).is_null() {
            self.head.store(ptr, Ordering::Relaxed);
            return;
        }
        let mut cursor = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: nodes in this list were pushed by this function and
            // remain valid until popped.
            let next = unsafe { (*cursor).wait_next.load(Ordering::Relaxed) };
            if next.is_null() {
                unsafe { (*cursor).wait_next.store(ptr, Ordering::Relaxed) };
                return;
            }
            cursor = next;
        }
    }

    fn remove(&mut self, thread: &'static Thread) -> bool {
        let target: *mut Thread = core::ptr::from_ref(thread).cast_mut();
        let mut prev: *mut Thread = core::ptr::null_mut();
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            // SAFETY: walking nodes pushed by `push_back`.
            let next = unsafe { (*cursor).wait_next.load(Ordering::Relaxed) };
            if cursor == target {
                if prev.is_null() {
                    self.head.store(next, Ordering::Relaxed);
                } else {
                    unsafe { (*prev).wait_next.store(next, Ordering::Relaxed) };
                }
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    fn pop_front(&mut self) -> Option<&'static Thread> {
        let head = self.head.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        // SAFETY: see `push_back`.
        let next = unsafe { (*head).wait_next.load(Ordering::Relaxed) };
        self.head.store(next, Ordering::Relaxed);
        Some(unsafe { &*head })
    }
}

/// A condition variable.
pub struct Condvar {
    waiters: IrqSpinLock<WaitList>,
}

impl Condvar {
    /// Creates an empty condition variable.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: IrqSpinLock::new(WaitList::new()),
        }
    }

    /// Atomically releases `guard`'s lock and blocks the calling thread,
    /// re-acquiring the lock before returning.
    ///
    /// The caller must re-check its wait condition after this returns: a
    /// spurious wake due to a concurrent `notify` racing the predicate is
    /// possible, as with any condvar.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>, lock: &'a Mutex<T>) -> MutexGuard<'a, T> {
        let Some(current) = crate::sched::current() else {
            // No scheduler yet (host tests, early boot): nothing can wake
            // us, so don't actually block.
            return guard;
        };

        {
            let mut w = self.waiters.lock();
            w.push_back(current);
        }
        drop(guard);

        current.set_state(ThreadState::Blocked);
        crate::sched::suspend_current();

        lock.lock()
    }

    /// Like [`Condvar::wait`], but gives up and returns after `timeout_ticks`
    /// timer ticks if no `notify` arrives first.
    ///
    /// Returns the reacquired guard along with the [`WakeReason`].
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        lock: &'a Mutex<T>,
        timeout_ticks: u64,
    ) -> (MutexGuard<'a, T>, WakeReason) {
        let Some(current) = crate::sched::current() else {
            return (guard, WakeReason::None);
        };

        let cookie = current.wait_cookie.begin();
        let deadline = crate::timer::now() + timeout_ticks;
        crate::timer::schedule_timeout(current, cookie, deadline);

        {
            let mut w = self.waiters.lock();
            w.push_back(current);
        }
        drop(guard);

        current.set_state(ThreadState::Blocked);
        crate::sched::suspend_current();

        // `notify_one`/`notify_all` bump the cookie before requeuing; a
        // timer fire does not. An unchanged cookie means the timer won, in
        // which case this thread is still linked into `waiters` and must be
        // unlinked here since the timer has no knowledge of this list.
        let reason = if current.wait_cookie.is_current(cookie) {
            self.waiters.lock().remove(current);
            WakeReason::Timeout
        } else {
            WakeReason::Signal
        };

        (lock.lock(), reason)
    }

    /// Wakes one waiting thread, if any.
    pub fn notify_one(&self) {
        let woken = self.waiters.lock().pop_front();
        if let Some(thread) = woken {
            thread.wait_cookie.begin();
            thread.set_state(ThreadState::Ready);
            crate::sched::requeue(thread);
        }
    }

    /// Wakes every waiting thread.
    pub fn notify_all(&self) {
        loop {
            let woken = self.waiters.lock().pop_front();
            match woken {
                Some(thread) => {
                    thread.wait_cookie.begin();
                    thread.set_state(ThreadState::Ready);
                    crate::sched::requeue(thread);
                }
                None => break,
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_without_scheduler_returns_immediately() {
        let lock = Mutex::new(0);
        let cv = Condvar::new();
        let guard = lock.lock();
        let guard = cv.wait(guard, &lock);
        assert_eq!(*guard, 0);
    }

    #[test]
    fn notify_on_empty_list_is_a_no_op() {
        let cv = Condvar::new();
        cv.notify_one();
        cv.notify_all();
    }
}
