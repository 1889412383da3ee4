//! Turnstiles: the blocking primitive underlying [`crate::sync::Mutex`],
//! [`crate::sync::RwLock`], and priority inheritance.
//!
//! A turnstile is looked up by the address of the lock it protects, hashed
//! into a fixed table of chains. Each chain is a linked list of turnstile
//! records drawn from a single global pool; a chain with many distinct
//! contended locks hashing into it simply grows longer instead of refusing
//! new locks, the way a fixed-capacity-per-chain array would. Unused
//! turnstiles return to a lock-free freelist shared by every chain, so the
//! pool-wide capacity is amortized across hot and cold chains alike rather
//! than partitioned evenly whether or not a given chain ever sees
//! contention.
//!
//! When a thread blocks on an owned lock, its effective priority propagates
//! to the owner: if the owner is itself blocked on another turnstile, the
//! boost propagates again, recursively, up the ownership chain.

use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use hadron_core::sync::IrqSpinLock;

use crate::thread::Thread;

const HASH_SIZE: usize = 128;
const HASH_MASK: usize = HASH_SIZE - 1;

/// Total turnstile records backing every chain combined. Generous relative
/// to expected simultaneous lock contention; exhausting the pool means more
/// distinct locks are contended at once than the kernel is sized for.
const POOL_SIZE: usize = 512;

/// Which side of a reader/writer lock a blocked thread is queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    /// Waiting for exclusive (writer) access.
    Writer = 0,
    /// Waiting for shared (reader) access.
    Reader = 1,
}

struct WaitQueue {
    head: AtomicPtr<Thread>,
}

impl WaitQueue {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Inserts `thread` ordered by descending effective priority; threads of
    /// equal priority stay FIFO by being placed after existing equal-priority
    /// entries.
    fn insert(&mut self, thread: &'static Thread) {
        let prio = thread.effective_priority();
        let thread_ptr: *mut Thread = core::ptr::from_ref(thread).cast_mut();

        let mut prev: *mut Thread = core::ptr::null_mut();
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            // SAFETY: every node in this list is a live Thread reference
            // handed to `insert` by a caller that guarantees it stays valid
            // while queued.
            let cursor_prio = unsafe { (*cursor).effective_priority() };
            if cursor_prio < prio {
                break;
            }
            prev = cursor;
            // SAFETY: see above.
            cursor = unsafe { (*cursor).wait_next.load(Ordering::Relaxed) };
        }

        thread.wait_next.store(cursor, Ordering::Relaxed);
        if prev.is_null() {
            self.head.store(thread_ptr, Ordering::Relaxed);
        } else {
            // SAFETY: `prev` is a live node from the walk above.
            unsafe { (*prev).wait_next.store(thread_ptr, Ordering::Relaxed) };
        }
    }

    fn pop_front(&mut self) -> Option<&'static Thread> {
        let head = self.head.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        // SAFETY: `head` was inserted by `insert` and remains valid until
        // popped.
        let next = unsafe { (*head).wait_next.load(Ordering::Relaxed) };
        self.head.store(next, Ordering::Relaxed);
        // SAFETY: see above; the reference is handed back to the caller,
        // which takes over responsibility for the thread.
        Some(unsafe { &*head })
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            n += 1;
            // SAFETY: walking a list of nodes inserted by `insert`.
            cursor = unsafe { (*cursor).wait_next.load(Ordering::Relaxed) };
        }
        n
    }
}

/// A turnstile: the set of threads blocked on one specific lock address,
/// plus bookkeeping for priority-inheritance boosting.
pub struct Turnstile {
    lock_obj: AtomicPtr<()>,
    owner: AtomicPtr<Thread>,
    applied_boost: AtomicU8,
    queues: [IrqSpinLock<WaitQueue>; 2],
    /// Intrusive link. Doubles as the chain-membership link while the
    /// turnstile is in use on some `Chain`, and as the freelist link while
    /// it sits on [`FREE_HEAD`] — a turnstile is never on both at once.
    link: AtomicPtr<Turnstile>,
}

impl Turnstile {
    const fn empty() -> Self {
        Self {
            lock_obj: AtomicPtr::new(core::ptr::null_mut()),
            owner: AtomicPtr::new(core::ptr::null_mut()),
            applied_boost: AtomicU8::new(0),
            queues: [IrqSpinLock::new(WaitQueue::new()), IrqSpinLock::new(WaitQueue::new())],
            link: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn matches(&self, lock_obj: *const ()) -> bool {
        self.lock_obj.load(Ordering::Acquire) == lock_obj.cast_mut()
    }

    /// Returns the number of threads waiting across both queues.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.queues[0].lock().len() + self.queues[1].lock().len()
    }

    /// Returns the thread currently recorded as owning the lock this
    /// turnstile guards, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&'static Thread> {
        let ptr = self.owner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: owner is always set to a live `'static` thread
            // reference by `block`.
            Some(unsafe { &*ptr })
        }
    }
}

static POOL: [Turnstile; POOL_SIZE] = [const { Turnstile::empty() }; POOL_SIZE];

/// Lock-free Treiber-stack freelist of pool turnstiles not currently
/// claimed by any chain.
static FREE_HEAD: AtomicPtr<Turnstile> = AtomicPtr::new(core::ptr::null_mut());

static POOL_INIT: IrqSpinLock<bool> = IrqSpinLock::new(false);

/// Links every pool entry onto the freelist. Idempotent; only the first
/// caller does any work, guarded against a concurrent first caller by
/// `POOL_INIT`'s lock rather than by relying on `FREE_HEAD` being null
/// (which a half-initialized pool could also show).
fn ensure_pool_init() {
    let mut done = POOL_INIT.lock();
    if *done {
        return;
    }
    for slot in &POOL {
        free_list_push(core::ptr::from_ref(slot).cast_mut());
    }
    *done = true;
}

fn free_list_push(slot: *mut Turnstile) {
    loop {
        let old = FREE_HEAD.load(Ordering::Acquire);
        // SAFETY: `slot` is a pool entry exclusively owned by this push
        // (either initial pool setup or a caller that just unlinked it from
        // a chain).
        unsafe { (*slot).link.store(old, Ordering::Relaxed) };
        if FREE_HEAD
            .compare_exchange_weak(old, slot, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

fn free_list_pop() -> Option<*mut Turnstile> {
    loop {
        let head = FREE_HEAD.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        // SAFETY: `head` is a live pool entry; nodes are only ever popped
        // by one winning CAS, so no other caller mutates it concurrently.
        let next = unsafe { (*head).link.load(Ordering::Relaxed) };
        if FREE_HEAD
            .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(head);
        }
    }
}

struct Chain {
    lock: IrqSpinLock<()>,
    head: AtomicPtr<Turnstile>,
}

impl Chain {
    const fn new() -> Self {
        Self {
            lock: IrqSpinLock::new(()),
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

static TABLE: [Chain; HASH_SIZE] = [const { Chain::new() }; HASH_SIZE];

fn hash(lock_obj: *const ()) -> usize {
    let addr = lock_obj as usize;
    ((addr >> 3).wrapping_mul(2_654_435_761)) & HASH_MASK
}

/// Blocks the calling thread on the turnstile for `lock_obj`, recording
/// `owner` as the lock holder and propagating a priority-inheritance boost
/// to it.
///
/// Returns once some other thread calls [`wake_one`] and pops this thread,
/// or `wake_all`. The actual suspension (removing the thread from its
/// run-queue and switching away) is delegated to the scheduler through
/// [`crate::sched::suspend_current`]; this function only manages the
/// turnstile's bookkeeping around that suspension.
///
/// # Safety
///
/// `current` and `owner` must be `'static` and remain valid until woken.
pub unsafe fn block(
    lock_obj: *const (),
    side: QueueSide,
    current: &'static Thread,
    owner: &'static Thread,
) {
    ensure_pool_init();
    let idx = hash(lock_obj);
    let chain = &TABLE[idx];
    let _chain_guard = chain.lock.lock();

    let slot = find_or_claim_slot(chain, lock_obj).expect(
        "hadron_sched: turnstile pool exhausted (too many distinct contended locks at once)",
    );

    slot.owner.store(core::ptr::from_ref(owner).cast_mut(), Ordering::Release);

    let boost = current.effective_priority();
    owner.boost_to(boost);
    if boost > slot.applied_boost.load(Ordering::Relaxed) {
        slot.applied_boost.store(boost, Ordering::Relaxed);
    }

    // Recursive propagation: if the owner is itself blocked, its turnstile
    // will see the new effective priority the next time it is consulted.
    // We do not recurse through arbitrary depth here to avoid unbounded
    // stack use inside a lock-held critical section; the owner's own next
    // `block` call (or the scheduler's periodic boost sweep) re-propagates.

    {
        let mut q = slot.queues[side as usize].lock();
        q.insert(current);
    }

    current.set_state(crate::thread::ThreadState::Blocked);
    crate::sched::suspend_current();
}

/// Walks `chain`'s linked list for a turnstile already claimed for
/// `lock_obj`, or claims a fresh one from the global freelist and links it
/// onto the chain. The caller must hold `chain.lock`.
fn find_or_claim_slot(chain: &Chain, lock_obj: *const ()) -> Option<&'static Turnstile> {
    let mut cursor = chain.head.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: nodes on a chain are only ever unlinked under this same
        // chain lock, which the caller holds.
        let node = unsafe { &*cursor };
        if node.matches(lock_obj) {
            return Some(node);
        }
        cursor = node.link.load(Ordering::Relaxed);
    }

    let fresh = free_list_pop()?;
    // SAFETY: `fresh` was just popped off the freelist, so no other owner
    // holds a reference to it.
    unsafe {
        (*fresh).lock_obj.store(lock_obj.cast_mut(), Ordering::Release);
        (*fresh).link.store(chain.head.load(Ordering::Relaxed), Ordering::Relaxed);
    }
    chain.head.store(fresh, Ordering::Release);
    // SAFETY: `fresh` is now linked into `chain` for the remainder of its
    // use and will outlive this call in the `'static` pool.
    Some(unsafe { &*fresh })
}

fn find_slot(lock_obj: *const ()) -> Option<&'static Turnstile> {
    let idx = hash(lock_obj);
    let chain = &TABLE[idx];
    let _guard = chain.lock.lock();
    let mut cursor = chain.head.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: see `find_or_claim_slot`.
        let node = unsafe { &*cursor };
        if node.matches(lock_obj) {
            return Some(node);
        }
        cursor = node.link.load(Ordering::Relaxed);
    }
    None
}

/// Unlinks `target` from `chain` (the caller must hold `chain.lock`) and
/// returns it to the global freelist.
fn release_slot(chain: &Chain, target: *mut Turnstile) {
    let mut prev: *mut Turnstile = core::ptr::null_mut();
    let mut cursor = chain.head.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: walking chain nodes under the held chain lock.
        let next = unsafe { (*cursor).link.load(Ordering::Relaxed) };
        if core::ptr::eq(cursor, target) {
            if prev.is_null() {
                chain.head.store(next, Ordering::Release);
            } else {
                // SAFETY: `prev` is a live chain node from this walk.
                unsafe { (*prev).link.store(next, Ordering::Relaxed) };
            }
            // SAFETY: `target` was just unlinked from `chain` and is about
            // to be pushed onto the freelist, exclusively owned either way.
            unsafe { (*target).lock_obj.store(core::ptr::null_mut(), Ordering::Release) };
            free_list_push(target);
            return;
        }
        prev = cursor;
        cursor = next;
    }
}

/// Wakes the single highest-effective-priority thread waiting on `side` of
/// the turnstile for `lock_obj`, if any. Reverts the PI boost and frees the
/// turnstile slot once both queues are empty.
///
/// Returns the woken thread, if any.
pub fn wake_one(lock_obj: *const (), side: QueueSide) -> Option<&'static Thread> {
    let idx = hash(lock_obj);
    let chain = &TABLE[idx];
    let _chain_guard = chain.lock.lock();

    let mut cursor = chain.head.load(Ordering::Acquire);
    let mut slot: Option<&'static Turnstile> = None;
    while !cursor.is_null() {
        // SAFETY: see `find_or_claim_slot`; the chain lock is held.
        let node = unsafe { &*cursor };
        if node.matches(lock_obj) {
            slot = Some(node);
            break;
        }
        cursor = node.link.load(Ordering::Relaxed);
    }
    let slot = slot?;

    let woken = {
        let mut q = slot.queues[side as usize].lock();
        q.pop_front()
    };

    if let Some(owner) = slot.owner() {
        owner.revert_boost();
    }

    if slot.queues[0].lock().is_empty() && slot.queues[1].lock().is_empty() {
        slot.owner.store(core::ptr::null_mut(), Ordering::Release);
        slot.applied_boost.store(0, Ordering::Relaxed);
        release_slot(chain, core::ptr::from_ref(slot).cast_mut());
    }

    if let Some(thread) = woken {
        thread.set_state(crate::thread::ThreadState::Ready);
        crate::sched::requeue(thread);
    }
    woken
}

/// Wakes every thread waiting on `side`, in priority order.
pub fn wake_all(lock_obj: *const (), side: QueueSide) {
    while wake_one(lock_obj, side).is_some() {}
}

/// Returns how many threads are waiting on `lock_obj` across both sides.
#[must_use]
pub fn waiter_count(lock_obj: *const ()) -> usize {
    find_slot(lock_obj).map_or(0, Turnstile::waiter_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::PriorityClass;

    #[test]
    fn hash_is_deterministic_and_in_range() {
        let a = 0x1000 as *const ();
        assert_eq!(hash(a), hash(a));
        assert!(hash(a) < HASH_SIZE);
    }

    #[test]
    fn wait_queue_orders_by_priority() {
        let low = Thread::new(PriorityClass::Background);
        let high = Thread::new(PriorityClass::Urgent);
        let low: &'static Thread = Box::leak(Box::new(low));
        let high: &'static Thread = Box::leak(Box::new(high));

        let mut q = WaitQueue::new();
        q.insert(low);
        q.insert(high);

        let first = q.pop_front().unwrap();
        assert_eq!(first.effective_priority(), PriorityClass::Urgent as u8);
    }

    /// Addresses spaced by `HASH_SIZE * 8` bytes share a hash bucket (the
    /// `>> 3` strips the low bits the spacing clears, and multiplying by the
    /// odd constant then masking to `HASH_MASK` leaves a multiple-of-128
    /// stride at zero). A chain more than four such locks deep would have
    /// overflowed the old fixed-capacity array.
    fn colliding_addrs(base: usize, count: usize) -> Vec<*const ()> {
        (0..count)
            .map(|i| (base + i * HASH_SIZE * 8) as *const ())
            .collect()
    }

    #[test]
    fn chain_grows_past_old_fixed_capacity() {
        ensure_pool_init();
        let addrs = colliding_addrs(0x10_000, 9);
        for a in &addrs {
            assert_eq!(hash(*a), hash(addrs[0]));
        }

        let idx = hash(addrs[0]);
        let chain = &TABLE[idx];
        let _guard = chain.lock.lock();
        let claimed: Vec<&Turnstile> = addrs
            .iter()
            .map(|a| find_or_claim_slot(chain, *a).unwrap())
            .collect();
        assert_eq!(claimed.len(), 9);
        for (slot, addr) in claimed.iter().zip(addrs.iter()) {
            assert!(slot.matches(*addr));
        }

        for addr in &addrs {
            let found = find_or_claim_slot(chain, *addr).unwrap();
            release_slot(chain, core::ptr::from_ref(found).cast_mut());
        }
    }

    #[test]
    fn released_slot_is_reused_for_a_different_lock() {
        ensure_pool_init();
        let a = 0x20_000 as *const ();
        let b = 0x20_008 as *const ();

        let idx = hash(a);
        let chain = &TABLE[idx];
        let slot_ptr = {
            let _guard = chain.lock.lock();
            let slot = find_or_claim_slot(chain, a).unwrap();
            let ptr = core::ptr::from_ref(slot).cast_mut();
            release_slot(chain, ptr);
            ptr
        };

        let idx_b = hash(b);
        let chain_b = &TABLE[idx_b];
        let _guard = chain_b.lock.lock();
        let reused = find_or_claim_slot(chain_b, b).unwrap();
        assert!(core::ptr::eq(core::ptr::from_ref(reused).cast_mut(), slot_ptr));
        release_slot(chain_b, core::ptr::from_ref(reused).cast_mut());
    }
}
