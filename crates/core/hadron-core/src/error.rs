//! The kernel-wide error taxonomy.
//!
//! Every public fallible operation in the workspace returns
//! `Result<T, KernelError>`, or a subsystem-local error enum that
//! `From`-converts into it. Irrecoverable conditions (double free, unknown
//! page fault, assertion failure) do not go through this type at all — they
//! go through `hadron_kernel::panic::kpanic!`.

use core::fmt;

/// The core's error kinds.
///
/// Source/sink mapping (which operations can produce which kind) is
/// per-subsystem; this enum only fixes the vocabulary every subsystem draws
/// from, so callers can match on it without caring which layer raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad argument: null pointer, invalid flag combination, out-of-range
    /// index.
    Inval,
    /// Allocation failure from the bitmap, buddy, or slab allocator.
    NoMem,
    /// A lookup in a cache or table missed.
    NoEnt,
    /// A device read or write returned a non-zero terminal status.
    Io,
    /// A wait primitive woke from timeout rather than from a signal.
    Timeout,
    /// A filesystem invariant was violated.
    ///
    /// Filesystems are out of this core's scope, but the kind is named here
    /// for completeness since external layers built on this core need a
    /// slot in the shared vocabulary.
    FsInternal,
}

impl KernelError {
    /// A short machine-stable name, useful for log records and assertions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inval => "EINVAL",
            Self::NoMem => "ENOMEM",
            Self::NoEnt => "ENOENT",
            Self::Io => "EIO",
            Self::Timeout => "ETIMEDOUT",
            Self::FsInternal => "EFSINTERNAL",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Inval => "invalid argument",
            Self::NoMem => "out of memory",
            Self::NoEnt => "no such entry",
            Self::Io => "I/O error",
            Self::Timeout => "operation timed out",
            Self::FsInternal => "filesystem invariant violated",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_matches_errno_style() {
        assert_eq!(KernelError::Inval.as_str(), "EINVAL");
        assert_eq!(KernelError::NoMem.as_str(), "ENOMEM");
        assert_eq!(KernelError::Timeout.as_str(), "ETIMEDOUT");
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(format!("{}", KernelError::NoEnt), "no such entry");
        assert_eq!(format!("{}", KernelError::Io), "I/O error");
    }

    #[test]
    fn errors_are_copy_and_comparable() {
        let a = KernelError::Inval;
        let b = a;
        assert_eq!(a, b);
        assert_ne!(KernelError::Inval, KernelError::NoMem);
    }
}
