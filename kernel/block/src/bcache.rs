//! Block cache: an LBA-keyed table of cached sector buffers shared by every
//! registered disk, evicted by a logical access tick rather than wall time.
//!
//! Mirrors [`hadron_sched::turnstile`]'s pool/freelist design: entries are
//! never heap-allocated. A fixed [`ENTRY_POOL_SIZE`]-element static pool is
//! claimed through a lock-free Treiber-stack freelist, and the hash table
//! itself (an open-addressed array of entry pointers with tombstone-based
//! deletion) is guarded by a single [`IrqSpinLock`], per this kernel's rule
//! that the cache's structural lock is one lock per cache, with each
//! entry's buffer independently guarded by its own
//! [`hadron_sched::sync::Mutex`] so readers of different entries never
//! contend on the table lock.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use hadron_core::error::KernelError;
use hadron_core::sync::IrqSpinLock;
use hadron_sched::sync::Mutex;

use crate::bio::{BioRequest, BioStatus};
use crate::bio_sched::BioScheduler;
use crate::disk::GenericDisk;

/// Bytes held per cache entry. One page; large enough for every sector size
/// this kernel's disks use times a small sectors-per-block factor.
pub const BLOCK_BUF_SIZE: usize = 4096;

/// Total entries backing the cache. Matches the kernel's default block
/// cache size.
const ENTRY_POOL_SIZE: usize = 2048;

/// Open-addressed table slots. Kept at roughly double the entry pool so the
/// table's load factor stays low enough for linear probing to terminate
/// quickly even when nearly every entry is in use.
const BUCKET_COUNT: usize = ENTRY_POOL_SIZE * 2;

const EMPTY: *mut BcacheEntry = core::ptr::null_mut();
/// Marks a slot that once held an entry since evicted. Probing must continue
/// past a tombstone (the entry that caused it may have been displaced
/// further along the probe sequence), but an insert may reuse it.
const TOMBSTONE: *mut BcacheEntry = core::ptr::without_provenance_mut(1);

/// One cached sector range.
pub struct BcacheEntry {
    disk: AtomicPtr<GenericDisk>,
    lba: AtomicU64,
    /// Bytes of `buffer` currently holding valid data.
    size: AtomicU32,
    /// Buffered sector data. Guarded independently of the table lock so
    /// concurrent readers of different entries never contend with each
    /// other or with a table insert/evict elsewhere.
    buffer: Mutex<[u8; BLOCK_BUF_SIZE]>,
    dirty: AtomicBool,
    /// Pinned entries (in-flight I/O, or explicitly marked) are never
    /// chosen by [`Bcache::evict`].
    no_evict: AtomicBool,
    refcount: AtomicU32,
    access_tick: AtomicU64,
    /// Freelist link. Only meaningful while the entry sits on [`FREE_HEAD`];
    /// entries linked into the table carry no chain of their own, since the
    /// table is open-addressed rather than chained.
    free_link: AtomicPtr<BcacheEntry>,
}

impl BcacheEntry {
    const fn empty() -> Self {
        Self {
            disk: AtomicPtr::new(core::ptr::null_mut()),
            lba: AtomicU64::new(0),
            size: AtomicU32::new(0),
            buffer: Mutex::new([0; BLOCK_BUF_SIZE]),
            dirty: AtomicBool::new(false),
            no_evict: AtomicBool::new(false),
            refcount: AtomicU32::new(0),
            access_tick: AtomicU64::new(0),
            free_link: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn matches(&self, disk: *const GenericDisk, lba: u64) -> bool {
        self.disk.load(Ordering::Acquire) == disk.cast_mut() && self.lba.load(Ordering::Acquire) == lba
    }

    /// Copies `data` into the entry's buffer under its own lock.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`BLOCK_BUF_SIZE`].
    pub fn write(&self, data: &[u8]) {
        assert!(data.len() <= BLOCK_BUF_SIZE, "hadron_block: write exceeds cache entry buffer");
        let mut guard = self.buffer.lock();
        guard[..data.len()].copy_from_slice(data);
        self.size.store(data.len() as u32, Ordering::Release);
    }

    /// Copies the entry's valid bytes into `out`, returning how many bytes
    /// were copied.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let guard = self.buffer.lock();
        let n = (self.size.load(Ordering::Acquire) as usize).min(out.len());
        out[..n].copy_from_slice(&guard[..n]);
        n
    }

    /// Whether the buffer holds writes not yet flushed to disk.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Releases the pin taken by [`Bcache::get`]. Must be called exactly
    /// once per successful `get`.
    pub fn unpin(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

static ENTRY_POOL: [BcacheEntry; ENTRY_POOL_SIZE] = [const { BcacheEntry::empty() }; ENTRY_POOL_SIZE];
static ENTRY_FREE_HEAD: AtomicPtr<BcacheEntry> = AtomicPtr::new(core::ptr::null_mut());
static ENTRY_POOL_INIT: IrqSpinLock<bool> = IrqSpinLock::new(false);

fn ensure_entry_pool_init() {
    let mut done = ENTRY_POOL_INIT.lock();
    if *done {
        return;
    }
    for slot in &ENTRY_POOL {
        entry_free_push(core::ptr::from_ref(slot).cast_mut());
    }
    *done = true;
}

fn entry_free_push(slot: *mut BcacheEntry) {
    loop {
        let old = ENTRY_FREE_HEAD.load(Ordering::Acquire);
        // SAFETY: `slot` is exclusively owned by this push (fresh pool entry
        // or one just removed from the table by `evict`).
        unsafe { (*slot).free_link.store(old, Ordering::Relaxed) };
        if ENTRY_FREE_HEAD
            .compare_exchange_weak(old, slot, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

fn entry_free_pop() -> Option<*mut BcacheEntry> {
    loop {
        let head = ENTRY_FREE_HEAD.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        // SAFETY: `head` is a live pool entry owned by whichever caller wins
        // the CAS below.
        let next = unsafe { (*head).free_link.load(Ordering::Relaxed) };
        if ENTRY_FREE_HEAD
            .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(head);
        }
    }
}

fn hash(disk: *const GenericDisk, lba: u64) -> usize {
    let mixed = (disk as usize as u64) ^ lba.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed as usize) % BUCKET_COUNT
}

/// The block cache's single, cache-wide open-addressed hash table.
///
/// There is exactly one instance of this type in the kernel ([`cache`]);
/// every disk shares it, keyed by `(disk address, lba)`, the same way the
/// original driver kept one cache for the whole block layer rather than one
/// per device.
pub struct Bcache {
    table: IrqSpinLock<[*mut BcacheEntry; BUCKET_COUNT]>,
    ticks: AtomicU64,
}

// SAFETY: table contents are raw pointers into the 'static ENTRY_POOL, only
// ever touched under `table`'s lock.
unsafe impl Send for Bcache {}
unsafe impl Sync for Bcache {}

impl Bcache {
    const fn new() -> Self {
        Self {
            table: IrqSpinLock::new([EMPTY; BUCKET_COUNT]),
            ticks: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the cached entry for `(disk, lba)`, populating it from disk
    /// on a miss. The caller must [`BcacheEntry::unpin`] the result exactly
    /// once when done.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Inval`] if `size` exceeds [`BLOCK_BUF_SIZE`],
    /// [`KernelError::NoMem`] if the pool is exhausted and nothing is
    /// evictable, or the disk's own read error.
    pub fn get(&self, disk: &'static GenericDisk, lba: u64, size: usize) -> Result<&'static BcacheEntry, KernelError> {
        if size > BLOCK_BUF_SIZE {
            return Err(KernelError::Inval);
        }
        ensure_entry_pool_init();

        if let Some(entry) = self.lookup(disk, lba) {
            entry.refcount.fetch_add(1, Ordering::AcqRel);
            entry.access_tick.store(self.tick(), Ordering::Release);
            return Ok(entry);
        }

        let entry_ptr = match entry_free_pop() {
            Some(p) => p,
            None => {
                self.evict()?;
                entry_free_pop().ok_or(KernelError::NoMem)?
            }
        };
        // SAFETY: `entry_ptr` was just claimed from the freelist, exclusively
        // owned until linked into the table below.
        let entry = unsafe { &*entry_ptr };
        entry.disk.store(core::ptr::from_ref(disk).cast_mut(), Ordering::Release);
        entry.lba.store(lba, Ordering::Release);
        entry.dirty.store(false, Ordering::Release);
        entry.no_evict.store(true, Ordering::Release);
        entry.refcount.store(1, Ordering::Release);
        entry.access_tick.store(self.tick(), Ordering::Release);

        self.insert(entry_ptr);

        let sectors = (size.div_ceil(disk.sector_size as usize)).max(1) as u32;
        let read_len = (sectors as usize * disk.sector_size as usize).min(BLOCK_BUF_SIZE);
        let mut buf = [0u8; BLOCK_BUF_SIZE];
        let read = disk.read_raw(lba, sectors, &mut buf[..read_len]);
        entry.no_evict.store(false, Ordering::Release);
        match read {
            Ok(_) => {
                entry.write(&buf[..size.min(read_len)]);
                Ok(entry)
            }
            Err(e) => {
                self.remove(disk, lba);
                entry_free_push(entry_ptr);
                Err(e)
            }
        }
    }

    fn lookup(&self, disk: &'static GenericDisk, lba: u64) -> Option<&'static BcacheEntry> {
        let table = self.table.lock();
        let start = hash(disk, lba);
        for i in 0..BUCKET_COUNT {
            let idx = (start + i) % BUCKET_COUNT;
            let slot = table[idx];
            if slot == EMPTY {
                return None;
            }
            if slot == TOMBSTONE {
                continue;
            }
            // SAFETY: non-tombstone, non-null slots point into the 'static
            // pool and stay valid until `remove` replaces them.
            let entry = unsafe { &*slot };
            if entry.matches(core::ptr::from_ref(disk), lba) {
                return Some(entry);
            }
        }
        None
    }

    fn insert(&self, entry_ptr: *mut BcacheEntry) {
        // SAFETY: caller just initialized `disk`/`lba` on this entry.
        let (disk, lba) = unsafe { ((*entry_ptr).disk.load(Ordering::Acquire), (*entry_ptr).lba.load(Ordering::Acquire)) };
        let mut table = self.table.lock();
        let start = hash(disk, lba);
        for i in 0..BUCKET_COUNT {
            let idx = (start + i) % BUCKET_COUNT;
            if table[idx] == EMPTY || table[idx] == TOMBSTONE {
                table[idx] = entry_ptr;
                return;
            }
        }
        unreachable!("hadron_block: bcache table full beyond entry pool capacity");
    }

    fn remove(&self, disk: &'static GenericDisk, lba: u64) {
        let mut table = self.table.lock();
        let start = hash(disk, lba);
        for i in 0..BUCKET_COUNT {
            let idx = (start + i) % BUCKET_COUNT;
            let slot = table[idx];
            if slot == EMPTY {
                return;
            }
            if slot == TOMBSTONE {
                continue;
            }
            // SAFETY: see `lookup`.
            let entry = unsafe { &*slot };
            if entry.matches(core::ptr::from_ref(disk), lba) {
                table[idx] = TOMBSTONE;
                return;
            }
        }
    }

    /// Flushes `entry` to disk through `disk.write_raw` and clears its dirty
    /// bit. Used by eviction and can be called directly to force a
    /// writeback.
    fn flush(&self, disk: &'static GenericDisk, entry: &BcacheEntry) -> Result<(), KernelError> {
        let size = entry.size.load(Ordering::Acquire) as usize;
        let mut buf = [0u8; BLOCK_BUF_SIZE];
        let n = entry.read(&mut buf[..size]);
        let sectors = ((n.max(1)).div_ceil(disk.sector_size as usize)) as u32;
        disk.write_raw(entry.lba.load(Ordering::Acquire), sectors, &buf[..n])?;
        entry.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Writes `data` for `(disk, lba)` immediately: populates or updates the
    /// cache entry and flushes it to disk before returning.
    ///
    /// # Errors
    ///
    /// As [`Bcache::get`], plus the disk's write error.
    pub fn writethrough(&self, disk: &'static GenericDisk, lba: u64, data: &[u8]) -> Result<(), KernelError> {
        let entry = self.get(disk, lba, data.len())?;
        entry.write(data);
        let result = self.flush(disk, entry);
        entry.unpin();
        result
    }

    /// Writes `data` for `(disk, lba)` into the cache and marks it dirty
    /// without flushing; the write reaches disk on a later eviction or
    /// explicit flush, via [`crate::bio_sched::BioScheduler`] for anything
    /// submitted asynchronously.
    ///
    /// # Errors
    ///
    /// As [`Bcache::get`].
    pub fn write_queue(&self, disk: &'static GenericDisk, lba: u64, data: &[u8]) -> Result<(), KernelError> {
        let entry = self.get(disk, lba, data.len())?;
        entry.write(data);
        entry.dirty.store(true, Ordering::Release);
        entry.unpin();
        Ok(())
    }

    /// Evicts the least-recently-accessed unpinned, non-dirty-pinned entry,
    /// flushing it first if dirty.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoMem`] if every entry is pinned (`refcount >
    /// 0` or `no_evict`), or the flush's write error if eviction of a dirty
    /// entry fails.
    pub fn evict(&self) -> Result<(), KernelError> {
        let mut victim: Option<&'static BcacheEntry> = None;
        let mut victim_tick = u64::MAX;
        for entry in &ENTRY_POOL {
            if entry.disk.load(Ordering::Acquire).is_null() {
                continue;
            }
            if entry.refcount.load(Ordering::Acquire) > 0 || entry.no_evict.load(Ordering::Acquire) {
                continue;
            }
            let t = entry.access_tick.load(Ordering::Acquire);
            if t < victim_tick {
                victim_tick = t;
                victim = Some(entry);
            }
        }
        let victim = victim.ok_or(KernelError::NoMem)?;

        let disk_ptr = victim.disk.load(Ordering::Acquire);
        // SAFETY: a live entry's `disk` pointer was set from a `&'static
        // GenericDisk` in `get` and never changes while the entry is
        // occupied.
        let disk: &'static GenericDisk = unsafe { &*disk_ptr };
        let lba = victim.lba.load(Ordering::Acquire);

        if victim.is_dirty() {
            self.flush(disk, victim)?;
        }

        self.remove(disk, lba);
        victim.disk.store(core::ptr::null_mut(), Ordering::Release);
        let victim_ptr: *mut BcacheEntry = core::ptr::from_ref(victim).cast_mut();
        entry_free_push(victim_ptr);
        Ok(())
    }

    /// Adopts already-fetched bytes for `(disk, lba)` into the cache without
    /// performing a read, for use by [`prefetch_complete`] once a background
    /// transfer lands. A no-op if the entry is already cached.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Inval`] if `data` exceeds [`BLOCK_BUF_SIZE`], or
    /// [`KernelError::NoMem`] if the pool is exhausted and nothing is
    /// evictable.
    fn adopt(&self, disk: &'static GenericDisk, lba: u64, data: &[u8]) -> Result<(), KernelError> {
        if data.len() > BLOCK_BUF_SIZE {
            return Err(KernelError::Inval);
        }
        ensure_entry_pool_init();

        if let Some(entry) = self.lookup(disk, lba) {
            entry.access_tick.store(self.tick(), Ordering::Release);
            return Ok(());
        }

        let entry_ptr = match entry_free_pop() {
            Some(p) => p,
            None => {
                self.evict()?;
                entry_free_pop().ok_or(KernelError::NoMem)?
            }
        };
        // SAFETY: `entry_ptr` was just claimed from the freelist, exclusively
        // owned until linked into the table below.
        let entry = unsafe { &*entry_ptr };
        entry.disk.store(core::ptr::from_ref(disk).cast_mut(), Ordering::Release);
        entry.lba.store(lba, Ordering::Release);
        entry.dirty.store(false, Ordering::Release);
        entry.no_evict.store(false, Ordering::Release);
        entry.refcount.store(0, Ordering::Release);
        entry.access_tick.store(self.tick(), Ordering::Release);
        entry.write(data);

        self.insert(entry_ptr);
        Ok(())
    }
}

static CACHE: Bcache = Bcache::new();

/// The kernel's single block cache instance.
#[must_use]
pub fn cache() -> &'static Bcache {
    &CACHE
}

/// Issues a background read of `req.disk`/`req.lba` through `scheduler`,
/// populating the cache with the fetched bytes on completion, without
/// blocking the caller.
///
/// `req` is caller-owned, like every [`BioRequest`] submission in this
/// crate, and must be constructed with [`crate::bio::BioRequestPriority::Background`]
/// and `on_complete` set to [`prefetch_complete`].
pub fn prefetch_async(req: &'static BioRequest, scheduler: &'static BioScheduler) {
    scheduler.enqueue(req);
}

/// Completion callback for a request submitted through [`prefetch_async`]:
/// adopts the fetched bytes into the cache and otherwise discards the
/// request, since nothing is waiting on a prefetch directly.
///
/// # Safety
///
/// Must only be used as the `on_complete` of a request submitted through
/// [`prefetch_async`], and only while `req` is still valid.
pub unsafe fn prefetch_complete(req: *mut BioRequest) {
    // SAFETY: contract above.
    let req = unsafe { &*req };
    if req.status() != BioStatus::Ok {
        return;
    }
    let len = ((req.sector_count as usize) * (req.disk.sector_size as usize)).min(BLOCK_BUF_SIZE);
    // SAFETY: the submitter guarantees `buffer` is valid for at least `len`
    // bytes and the transfer has completed.
    let data = unsafe { core::slice::from_raw_parts(req.buffer.cast_const(), len) };
    let _ = cache().adopt(req.disk, req.lba, data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskOps, GenericDiskFlags, GenericDiskType};
    use std::sync::Mutex as StdMutex;

    static BACKING: StdMutex<[u8; 8192]> = StdMutex::new([0; 8192]);

    unsafe fn disk_read(_d: *mut (), lba: u64, count: u32, buf: *mut u8) -> Result<u32, KernelError> {
        let backing = BACKING.lock().unwrap();
        let off = (lba as usize) * 512;
        let len = (count as usize) * 512;
        // SAFETY: test-only disk; buffer sized by caller.
        unsafe { core::ptr::copy_nonoverlapping(backing[off..off + len].as_ptr(), buf, len) };
        Ok(count)
    }

    unsafe fn disk_write(_d: *mut (), lba: u64, count: u32, buf: *const u8) -> Result<u32, KernelError> {
        let mut backing = BACKING.lock().unwrap();
        let off = (lba as usize) * 512;
        let len = (count as usize) * 512;
        // SAFETY: test-only disk.
        unsafe { core::ptr::copy_nonoverlapping(buf, backing[off..off + len].as_mut_ptr(), len) };
        Ok(count)
    }

    static TEST_DISK: GenericDisk = GenericDisk::new(
        "cachetest",
        GenericDiskType::Virtual,
        GenericDiskFlags::empty(),
        512,
        16,
        core::ptr::null_mut(),
        DiskOps {
            read_sectors: disk_read,
            write_sectors: disk_write,
        },
    );

    #[test]
    fn get_populates_from_disk_on_miss() {
        {
            let mut b = BACKING.lock().unwrap();
            b[512..516].copy_from_slice(&[1, 2, 3, 4]);
        }
        let entry = cache().get(&TEST_DISK, 1, 512).unwrap();
        let mut out = [0u8; 4];
        entry.read(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        entry.unpin();
    }

    #[test]
    fn writer_and_reader_see_same_bytes_without_disk_round_trip() {
        cache().writethrough(&TEST_DISK, 2, &[9, 9, 9, 9]).unwrap();
        let entry = cache().get(&TEST_DISK, 2, 512).unwrap();
        let mut out = [0u8; 4];
        entry.read(&mut out);
        assert_eq!(out, [9, 9, 9, 9]);
        entry.unpin();
    }

    #[test]
    fn write_queue_marks_dirty_without_immediate_flush() {
        {
            let mut b = BACKING.lock().unwrap();
            b[3 * 512..3 * 512 + 4].copy_from_slice(&[0, 0, 0, 0]);
        }
        cache().write_queue(&TEST_DISK, 3, &[7, 7, 7, 7]).unwrap();
        let entry = cache().get(&TEST_DISK, 3, 512).unwrap();
        assert!(entry.is_dirty());
        entry.unpin();
    }

    #[test]
    fn get_rejects_oversized_request() {
        assert_eq!(cache().get(&TEST_DISK, 4, BLOCK_BUF_SIZE + 1), Err(KernelError::Inval));
    }

    #[test]
    fn prefetch_complete_adopts_fetched_bytes_without_a_disk_round_trip() {
        static PREFETCH_BUF: StdMutex<[u8; 512]> = StdMutex::new([0; 512]);
        {
            let mut buf = PREFETCH_BUF.lock().unwrap();
            buf[..4].copy_from_slice(&[5, 6, 7, 8]);
        }
        let mut buf = *PREFETCH_BUF.lock().unwrap();
        let req = BioRequest::new(&TEST_DISK, 6, 1, buf.as_mut_ptr(), false, crate::bio::BioRequestPriority::Background, None);
        req.set_status(BioStatus::Ok);

        // SAFETY: `req` outlives this call and matches `prefetch_complete`'s
        // contract.
        unsafe { prefetch_complete(core::ptr::from_ref(&req).cast_mut()) };

        let entry = cache().lookup(&TEST_DISK, 6).expect("prefetched entry should be cached");
        let mut out = [0u8; 4];
        entry.read(&mut out);
        assert_eq!(out, [5, 6, 7, 8]);
    }
}
