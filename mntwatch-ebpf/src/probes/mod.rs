//! BPF-side bindings of the correlation core.
//!
//! Each collaborator trait of `mntwatch_common` is backed here by a helper
//! call or one of the maps in [`maps`]. The programs themselves live in
//! [`mount`] and [`umount`].

use core::mem::offset_of;

use aya_ebpf::{
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_get_current_pid_tgid,
        bpf_get_current_uid_gid, bpf_get_smp_processor_id, bpf_ktime_get_ns,
        bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes, bpf_probe_read_user_str_bytes,
    },
    maps::RingBuf,
    programs::{ProbeContext, TracePointContext},
};
use bytemuck::{Pod, Zeroable};
use mntwatch_common::{
    CacheError, Delivery, DentryWalker, EventSink, KernelMemory, KernelOffsets, KernelPtr,
    KernelView, MountProbes, PathKey, PathLeaf, PathStore, ProbeConfig, ProcCacheEntry,
    ProcessContext, ProcessContextProvider, ReadOutcome, SyscallCache, SyscallCacheEntry,
    SyscallExit, TaskId,
};

pub mod maps;
pub mod mount;
mod syscall_types;
pub mod umount;

use maps::*;
use syscall_types::SysExit;

/// Direct `bpf_probe_read_*` access.
pub struct BpfMemory;

impl KernelMemory for BpfMemory {
    #[inline(always)]
    fn read<T: Pod>(&self, addr: KernelPtr) -> Option<T> {
        unsafe { bpf_probe_read_kernel(addr.0 as *const T) }.ok()
    }

    #[inline(always)]
    fn read_user_str(&self, addr: u64, dst: &mut [u8]) -> ReadOutcome {
        if addr == 0 {
            dst.fill(0);
            return ReadOutcome::Faulted;
        }
        let copied =
            unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, dst) }.map(|s| s.len());
        str_outcome(copied, dst)
    }

    #[inline(always)]
    fn read_kernel_str(&self, addr: KernelPtr, dst: &mut [u8]) -> ReadOutcome {
        let copied =
            unsafe { bpf_probe_read_kernel_str_bytes(addr.0 as *const u8, dst) }.map(|s| s.len());
        str_outcome(copied, dst)
    }
}

#[inline(always)]
fn str_outcome<E>(copied: Result<usize, E>, dst: &mut [u8]) -> ReadOutcome {
    match copied {
        Ok(len) if len + 1 < dst.len() => ReadOutcome::Complete(len + 1),
        Ok(len) => ReadOutcome::Truncated(len + 1),
        Err(_) => {
            dst.fill(0);
            ReadOutcome::Faulted
        }
    }
}

/// [`SyscallCache`] over the `SYSCALLS` map.
pub struct SyscallMap;

impl SyscallCache for SyscallMap {
    #[inline(always)]
    fn insert(&self, tid: u32, entry: SyscallCacheEntry) -> Result<(), CacheError> {
        SYSCALLS.insert(&tid, &entry, 0).map_err(|_| CacheError::Full)
    }

    #[inline(always)]
    fn peek_with<R, F>(&self, tid: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut SyscallCacheEntry) -> R,
    {
        let entry = SYSCALLS.get_ptr_mut(&tid)?;
        Some(f(unsafe { &mut *entry }))
    }

    #[inline(always)]
    fn pop(&self, tid: u32) -> Option<SyscallCacheEntry> {
        let entry = unsafe { SYSCALLS.get(&tid) }.copied()?;
        // Whoever loses the removal race does not own the entry.
        SYSCALLS.remove(&tid).ok()?;
        Some(entry)
    }
}

/// [`PathStore`] over the `PATHNAMES` map.
pub struct PathnamesStore;

impl PathStore for PathnamesStore {
    #[inline(always)]
    fn store(&self, key: &PathKey, leaf: &PathLeaf) -> bool {
        PATHNAMES.insert(key, leaf, 0).is_ok()
    }
}

/// The task the probe fires in.
pub struct CurrentTask;

impl ProcessContextProvider for CurrentTask {
    #[inline(always)]
    fn fill_process_data(&self, task: TaskId) -> ProcessContext {
        let mut process = ProcessContext::zeroed();
        let uid_gid = bpf_get_current_uid_gid();

        process.pid = task.pid;
        process.tid = task.tid;
        process.uid = uid_gid as u32;
        process.gid = (uid_gid >> 32) as u32;
        process.cgroup_id = unsafe { bpf_get_current_cgroup_id() };
        if let Ok(comm) = bpf_get_current_comm() {
            process.comm = comm;
        }
        process
    }

    #[inline(always)]
    fn lookup_process_cache(&self, pid: u32) -> Option<ProcCacheEntry> {
        unsafe { PROC_CACHE.get(&pid) }.copied()
    }
}

/// [`EventSink`] reserving records straight in a ring buffer.
pub struct RingBufSink(pub &'static RingBuf);

impl<E: Pod> EventSink<E> for RingBufSink {
    #[inline(always)]
    fn deliver<F>(&self, fill: F) -> Delivery
    where
        F: FnOnce(&mut E) -> bool,
    {
        let Some(mut slot) = self.0.reserve::<E>(0) else {
            return Delivery::Dropped;
        };

        let event = unsafe {
            core::ptr::write_bytes(slot.as_mut_ptr(), 0, 1);
            &mut *slot.as_mut_ptr()
        };
        if fill(event) {
            slot.submit(0);
            Delivery::Submitted
        } else {
            slot.discard(0);
            Delivery::Filtered
        }
    }
}

pub type Probes<'a> = MountProbes<
    'a,
    BpfMemory,
    SyscallMap,
    DentryWalker<'a, BpfMemory, PathnamesStore>,
    CurrentTask,
>;

#[inline(always)]
fn kernel_offsets() -> KernelOffsets {
    match KERNEL_OFFSETS.get(0) {
        // An all-zero slot means user space never pushed its offsets.
        Some(offsets) if offsets.mount_id != 0 => *offsets,
        _ => KernelOffsets::DEFAULT,
    }
}

#[inline(always)]
fn probe_config() -> ProbeConfig {
    PROBE_CONFIG.get(0).copied().unwrap_or_default()
}

/// Run `f` against the correlation core wired to the live maps.
#[inline(always)]
pub fn with_probes<R>(f: impl FnOnce(&Probes<'_>) -> R) -> R {
    let offsets = kernel_offsets();
    let view = KernelView::new(&BpfMemory, &offsets);
    let probes = MountProbes::new(
        view,
        &SyscallMap,
        DentryWalker::new(view, &PathnamesStore),
        &CurrentTask,
        probe_config(),
    );
    f(&probes)
}

#[inline(always)]
pub fn current_task() -> TaskId {
    TaskId::from_pid_tgid(bpf_get_current_pid_tgid())
}

/// Gather what the exit probe knows from a `sys_exit_*` tracepoint.
#[inline(always)]
pub fn syscall_exit(ctx: &TracePointContext) -> SyscallExit {
    let ret: i64 = unsafe { ctx.read_at(offset_of!(SysExit, ret)) }.unwrap_or(0);
    SyscallExit {
        task: current_task(),
        retval: ret,
        timestamp: unsafe { bpf_ktime_get_ns() },
        cpu: unsafe { bpf_get_smp_processor_id() },
    }
}

/// First three pointer arguments of a kernel function.
#[inline(always)]
pub fn kernel_ptr_args(ctx: &ProbeContext) -> [KernelPtr; 3] {
    [
        KernelPtr(ctx.arg::<u64>(0).unwrap_or(0)),
        KernelPtr(ctx.arg::<u64>(1).unwrap_or(0)),
        KernelPtr(ctx.arg::<u64>(2).unwrap_or(0)),
    ]
}
