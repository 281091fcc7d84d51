#![cfg_attr(not(test), no_std)]

//! Shared kernel/user-space core for mntwatch.
//!
//! Everything that crosses the BPF boundary lives here as a fixed-layout
//! `#[repr(C)]` record, together with the syscall correlation logic that the
//! BPF programs run. The logic is written against small collaborator traits
//! ([`KernelMemory`], [`SyscallCache`], [`DentryResolver`],
//! [`ProcessContextProvider`], [`EventSink`]) so it can be exercised on the
//! host with in-memory fakes.

pub mod cache;
pub mod dentry;
pub mod event;
pub mod kernel;
pub mod mount;
pub mod probe;
pub mod process;
pub mod sink;
pub mod umount;

#[cfg(test)]
mod testing;

pub use cache::{CacheError, SyscallCache, SyscallCacheEntry, SyscallKind};
pub use dentry::{DentryResolver, DentryWalker, PathStore};
pub use event::{
    EventHeader, EventType, MountEvent, PathKey, PathLeaf, ProbeConfig, ProcCacheEntry,
    ProcessContext, UmountEvent,
};
pub use kernel::{KernelMemory, KernelOffsets, KernelPtr, KernelView, ReadOutcome};
pub use mount::{MountAttach, MountState};
pub use probe::{Exit, Intermediate, MountProbes, SyscallExit};
pub use process::{ProcessContextProvider, TaskId};
pub use sink::{Delivery, EventSink};
pub use umount::UmountState;

pub const FSTYPE_LEN: usize = 16;
pub const CONTAINER_ID_LEN: usize = 64;
pub const TASK_COMM_LEN: usize = 16;
pub const DENTRY_NAME_LEN: usize = 128;

/// Upper bound on dentry ancestry steps recorded per registration.
pub const DENTRY_MAX_DEPTH: usize = 16;

/// Capacity of the per-thread correlation table.
pub const SYSCALL_CACHE_ENTRIES: u32 = 4096;
pub const PATHNAMES_ENTRIES: u32 = 64 * 1024;
pub const PROC_CACHE_ENTRIES: u32 = 16 * 1024;
pub const EVENTS_RINGBUF_SIZE: u32 = 256 * 1024;

/// Interpret a NUL-padded byte buffer as a string, stopping at the first NUL.
pub fn c_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    match core::str::from_utf8(&bytes[..end]) {
        Ok(s) => s,
        Err(e) => {
            // Keep the valid prefix of a partially garbled copy.
            core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default()
        }
    }
}
