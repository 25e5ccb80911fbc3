//! User-fatal error conditions raised by the VM core.
//!
//! These never unwind or panic by themselves; callers (the page-fault
//! handler, syscall glue) decide how to terminate the offending process.
//! Programming-bug conditions (a desynced swap bitmap, evicting with every
//! frame pinned) remain `assert!`/`unreachable!` in the modules that detect
//! them, matching the kernel's existing style elsewhere in `mm.rs`.

use core::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmError {
    /// The faulting address is not a valid user pointer, or lies outside any
    /// mapped region and the stack-growth heuristic does not apply.
    BadPointer,
    /// A stack-growing access exceeded the fixed stack-size cap.
    StackOverflow,
    /// `mmap` was asked to cover a range that already has a descriptor.
    MmapRangeOccupied,
    /// `mmap` was called with invalid arguments (bad fd, zero-length file,
    /// unaligned or null address).
    MmapBadArgs,
    /// `munmap` referenced a `mapid` with no live mapping.
    UnknownMapid,
    /// Allocating a page descriptor's own backing storage failed. Distinct
    /// from physical-frame exhaustion, which `frame_new` resolves by
    /// eviction rather than reporting an error.
    OutOfMemory,
    /// A file-backed `page_in` read fewer bytes than expected.
    ShortRead,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::BadPointer => "bad user pointer",
            VmError::StackOverflow => "stack overflow beyond cap",
            VmError::MmapRangeOccupied => "mmap range already occupied",
            VmError::MmapBadArgs => "invalid mmap arguments",
            VmError::UnknownMapid => "unknown mapid",
            VmError::OutOfMemory => "out of memory",
            VmError::ShortRead => "short read while paging in",
        };
        f.write_str(msg)
    }
}
