//! Spin-based synchronization primitives.
//!
//! These are the only locks safe to use before a scheduler exists (early
//! boot, the PMM, the slab allocator) because they never block a thread —
//! they spin. Thread-blocking primitives that need a turnstile and a
//! scheduler to park on (`Mutex`, `RwLock`, `Condvar`, `Semaphore`) live in
//! `hadron_sched::sync` instead.

mod irq_spinlock;
mod lazy;
#[cfg(hadron_lockdep)]
pub mod lockdep;
mod spinlock;
#[cfg(hadron_lock_stress)]
pub mod stress;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
