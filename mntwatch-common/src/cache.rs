//! Per-thread syscall correlation cache.
//!
//! An entry is created when a monitored syscall enters, mutated by the kernel
//! function probes that fire while it runs, and consumed exactly once when it
//! returns. The backing table lives outside this crate (a BPF map in the
//! kernel, an in-memory arena in tests); this module only fixes its contract.

use crate::mount::MountState;
use crate::umount::UmountState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallKind {
    Mount,
    Umount,
}

/// In-flight state of one syscall, one variant per monitored syscall family.
/// The variant of a stored entry never changes.
#[repr(C, u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallCacheEntry {
    Mount(MountState),
    Umount(UmountState),
}

impl SyscallCacheEntry {
    pub fn kind(&self) -> SyscallKind {
        match self {
            SyscallCacheEntry::Mount(_) => SyscallKind::Mount,
            SyscallCacheEntry::Umount(_) => SyscallKind::Umount,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheError {
    /// No slot could be allocated for the thread.
    Full,
}

/// Bounded table of live syscall entries keyed by thread id.
///
/// Probes for one thread are serialized by the kernel, so implementations only
/// need per-key atomicity of the table itself.
pub trait SyscallCache {
    /// Create the live entry for `tid`, replacing any stale one.
    fn insert(&self, tid: u32, entry: SyscallCacheEntry) -> Result<(), CacheError>;

    /// Run `f` against the live entry for `tid` without removing it.
    /// Returns `None` when the thread has no syscall in flight.
    fn peek_with<R, F>(&self, tid: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut SyscallCacheEntry) -> R;

    /// Detach and return the live entry for `tid`. Only the caller whose
    /// removal succeeded gets `Some`.
    fn pop(&self, tid: u32) -> Option<SyscallCacheEntry>;
}
