use aya_ebpf::{
    macros::map,
    maps::{Array, LruHashMap, RingBuf},
};
use mntwatch_common::{
    EVENTS_RINGBUF_SIZE, KernelOffsets, PATHNAMES_ENTRIES, PROC_CACHE_ENTRIES, PathKey, PathLeaf,
    ProbeConfig, ProcCacheEntry, SYSCALL_CACHE_ENTRIES, SyscallCacheEntry,
};

/// Mount and umount records, told apart by their header.
#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RINGBUF_SIZE, 0);

/// In-flight syscalls keyed by tid. LRU so entries abandoned by a missed exit
/// are reclaimed.
#[map]
pub static SYSCALLS: LruHashMap<u32, SyscallCacheEntry> =
    LruHashMap::with_max_entries(SYSCALL_CACHE_ENTRIES, 0);

#[map]
pub static PATHNAMES: LruHashMap<PathKey, PathLeaf> =
    LruHashMap::with_max_entries(PATHNAMES_ENTRIES, 0);

/// Container context per pid, written by user space.
#[map]
pub static PROC_CACHE: LruHashMap<u32, ProcCacheEntry> =
    LruHashMap::with_max_entries(PROC_CACHE_ENTRIES, 0);

#[map]
pub static KERNEL_OFFSETS: Array<KernelOffsets> = Array::with_max_entries(1, 0);

#[map]
pub static PROBE_CONFIG: Array<ProbeConfig> = Array::with_max_entries(1, 0);
