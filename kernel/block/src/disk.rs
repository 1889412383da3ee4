//! Block device descriptor.
//!
//! `hadron-block` does not reuse `hadron_driver_api::block::BlockDevice`: that
//! trait is async and built for the executor-backed AHCI/NVMe drivers in
//! `hadron-kernel`. The cache and I/O scheduler in this crate are the layer
//! below that — synchronous, callback-driven, and callable before an
//! executor exists — so a disk is described the same way this kernel
//! describes a [`crate::bio::BioRequest`]'s completion or a
//! [`hadron_sched::dpc::Dpc`]'s deferred work: a caller-owned descriptor
//! plus a raw function pointer.

use hadron_core::error::KernelError;

/// Upper bound on partitions tracked per disk.
pub const MAX_PARTITIONS: usize = 16;

/// What kind of medium a disk descriptor represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenericDiskType {
    /// Rotational or solid-state fixed disk.
    Hdd,
    /// NVMe or AHCI-attached solid-state disk.
    Ssd,
    /// Removable optical or flash medium.
    Removable,
    /// In-memory or loopback-backed disk, used by tests and early boot.
    Virtual,
}

bitflags::bitflags! {
    /// Per-disk behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GenericDiskFlags: u8 {
        /// Bypass the I/O scheduler entirely: every request dispatches to
        /// the driver immediately, in submission order. Set for disks whose
        /// driver already reorders internally (e.g. NVMe's own queueing) or
        /// for synthetic test disks where submission order must be exact.
        const NO_SCHED = 1 << 0;
        /// The medium cannot be written to.
        const READ_ONLY = 1 << 1;
    }
}

/// One entry in a disk's partition table.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    /// First LBA belonging to this partition.
    pub start_lba: u64,
    /// Number of sectors in this partition.
    pub sector_count: u64,
}

/// Synchronous driver callbacks a [`GenericDisk`] dispatches through.
///
/// Mirrors the raw-function-pointer convention used for [`crate::bio::BioRequest`]
/// completions and the scheduler's DPC/APC objects: the driver that creates a
/// `GenericDisk` owns these function pointers and whatever context they close
/// over via `driver_data`.
pub struct DiskOps {
    /// Reads `sector_count` sectors starting at `lba` into `buf`, which is
    /// at least `sector_count * sector_size` bytes. Returns the number of
    /// sectors actually read, or an error.
    pub read_sectors:
        unsafe fn(driver_data: *mut (), lba: u64, sector_count: u32, buf: *mut u8) -> Result<u32, KernelError>,
    /// Writes `sector_count` sectors starting at `lba` from `buf`.
    pub write_sectors:
        unsafe fn(driver_data: *mut (), lba: u64, sector_count: u32, buf: *const u8) -> Result<u32, KernelError>,
}

/// A block device descriptor.
///
/// Caller-owned: a driver embeds one `GenericDisk` per device it registers
/// and hands a `'static` reference to [`crate::bcache`] and
/// [`crate::bio_sched`]. Not `Clone`: identity matters, since the cache and
/// scheduler key their per-disk state off this descriptor's address.
pub struct GenericDisk {
    /// Human-readable device name, e.g. `"sda"`.
    pub name: &'static str,
    /// Medium kind.
    pub disk_type: GenericDiskType,
    /// Behavior flags.
    pub flags: GenericDiskFlags,
    /// Bytes per sector. Must be a power of two, at least 512.
    pub sector_size: u32,
    /// Total addressable sectors on the medium.
    pub total_sectors: u64,
    /// Opaque driver context passed back into every [`DiskOps`] callback.
    pub driver_data: *mut (),
    /// Synchronous read/write entry points.
    pub ops: DiskOps,
    /// Fixed-size partition table. Unused slots have `sector_count == 0`.
    pub partitions: [Partition; MAX_PARTITIONS],
}

// SAFETY: `driver_data` is only ever dereferenced inside the driver's own
// `ops` callbacks, which the driver author is responsible for making
// thread-safe; the descriptor fields themselves are plain data.
unsafe impl Send for GenericDisk {}
unsafe impl Sync for GenericDisk {}

impl GenericDisk {
    /// Creates a disk descriptor with an empty partition table.
    #[must_use]
    pub const fn new(
        name: &'static str,
        disk_type: GenericDiskType,
        flags: GenericDiskFlags,
        sector_size: u32,
        total_sectors: u64,
        driver_data: *mut (),
        ops: DiskOps,
    ) -> Self {
        const EMPTY_PARTITION: Partition = Partition {
            start_lba: 0,
            sector_count: 0,
        };
        Self {
            name,
            disk_type,
            flags,
            sector_size,
            total_sectors,
            driver_data,
            ops,
            partitions: [EMPTY_PARTITION; MAX_PARTITIONS],
        }
    }

    /// Reads `sector_count` sectors starting at `lba` directly through the
    /// driver, bypassing the cache and scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Inval`] if the request runs past the end of
    /// the medium or `sector_count` is zero, or whatever the driver
    /// callback itself returns.
    pub fn read_raw(&self, lba: u64, sector_count: u32, buf: &mut [u8]) -> Result<u32, KernelError> {
        self.validate_range(lba, sector_count, buf.len())?;
        // SAFETY: `driver_data` and `buf` are valid for the duration of this
        // call per the driver's own contract; range was checked above.
        unsafe { (self.ops.read_sectors)(self.driver_data, lba, sector_count, buf.as_mut_ptr()) }
    }

    /// Writes `sector_count` sectors starting at `lba` directly through the
    /// driver, bypassing the cache and scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Inval`] on an out-of-range or zero-length
    /// request, or the driver callback's own error.
    pub fn write_raw(&self, lba: u64, sector_count: u32, buf: &[u8]) -> Result<u32, KernelError> {
        if self.flags.contains(GenericDiskFlags::READ_ONLY) {
            return Err(KernelError::Inval);
        }
        self.validate_range(lba, sector_count, buf.len())?;
        // SAFETY: see `read_raw`.
        unsafe { (self.ops.write_sectors)(self.driver_data, lba, sector_count, buf.as_ptr()) }
    }

    fn validate_range(&self, lba: u64, sector_count: u32, buf_len: usize) -> Result<(), KernelError> {
        if sector_count == 0 {
            return Err(KernelError::Inval);
        }
        let end = lba.checked_add(u64::from(sector_count)).ok_or(KernelError::Inval)?;
        if end > self.total_sectors {
            return Err(KernelError::Inval);
        }
        let needed = (sector_count as usize).saturating_mul(self.sector_size as usize);
        if buf_len < needed {
            return Err(KernelError::Inval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static READ_CALLS: AtomicU32 = AtomicU32::new(0);
    static WRITE_CALLS: AtomicU32 = AtomicU32::new(0);

    unsafe fn fake_read(_d: *mut (), _lba: u64, count: u32, buf: *mut u8) -> Result<u32, KernelError> {
        READ_CALLS.fetch_add(1, Ordering::Relaxed);
        // SAFETY: test driver; buffer sized by caller per sector_size.
        unsafe { core::ptr::write_bytes(buf, 0xAB, (count as usize) * 512) };
        Ok(count)
    }

    unsafe fn fake_write(_d: *mut (), _lba: u64, count: u32, _buf: *const u8) -> Result<u32, KernelError> {
        WRITE_CALLS.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    fn test_disk() -> GenericDisk {
        GenericDisk::new(
            "testdisk",
            GenericDiskType::Virtual,
            GenericDiskFlags::empty(),
            512,
            1024,
            core::ptr::null_mut(),
            DiskOps {
                read_sectors: fake_read,
                write_sectors: fake_write,
            },
        )
    }

    #[test]
    fn read_raw_rejects_zero_sector_count() {
        let disk = test_disk();
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_raw(0, 0, &mut buf), Err(KernelError::Inval));
    }

    #[test]
    fn read_raw_rejects_out_of_range() {
        let disk = test_disk();
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_raw(1023, 2, &mut buf), Err(KernelError::Inval));
    }

    #[test]
    fn read_raw_dispatches_to_driver() {
        let disk = test_disk();
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_raw(0, 1, &mut buf), Ok(1));
        assert_eq!(buf[0], 0xAB);
        assert_eq!(READ_CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn write_raw_rejects_read_only_disk() {
        let mut disk = test_disk();
        disk.flags = GenericDiskFlags::READ_ONLY;
        let buf = [0u8; 512];
        assert_eq!(disk.write_raw(0, 1, &buf), Err(KernelError::Inval));
        assert_eq!(WRITE_CALLS.load(Ordering::Relaxed), 0);
    }
}
