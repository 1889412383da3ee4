//! Thread-blocking synchronization primitives, layered on [`crate::turnstile`].

mod condvar;
mod mutex;
mod rwlock;
mod semaphore;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
