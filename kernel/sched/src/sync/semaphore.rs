//! A counting semaphore built from a spinlocked count and an embedded
//! condition variable.

use crate::sync::condvar::Condvar;
use crate::sync::mutex::Mutex;

/// A counting semaphore.
pub struct Semaphore {
    count: Mutex<u64>,
    nonzero: Condvar,
}

impl Semaphore {
    /// Creates a semaphore starting at `initial`.
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            nonzero: Condvar::new(),
        }
    }

    /// Blocks until the count is positive, then decrements it by one.
    pub fn wait(&self) {
        let mut guard = self.count.lock();
        while *guard == 0 {
            guard = self.nonzero.wait(guard, &self.count);
        }
        *guard -= 1;
    }

    /// Decrements the count by one without blocking if it is already
    /// positive. Returns whether it succeeded.
    pub fn try_wait(&self) -> bool {
        let mut guard = self.count.lock();
        if *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }

    /// Increments the count by `n`, waking up to `n` waiters.
    pub fn post(&self, n: u64) {
        {
            let mut guard = self.count.lock();
            *guard += n;
        }
        for _ in 0..n {
            self.nonzero.notify_one();
        }
    }

    /// Returns the current count. Racy by nature; intended for diagnostics.
    #[must_use]
    pub fn count(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_wait_succeeds_when_positive() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn post_increments_count() {
        let sem = Semaphore::new(0);
        sem.post(3);
        assert_eq!(sem.count(), 3);
    }

    #[test]
    fn wait_without_scheduler_does_not_hang_when_nonzero() {
        let sem = Semaphore::new(1);
        sem.wait();
        assert_eq!(sem.count(), 0);
    }
}
