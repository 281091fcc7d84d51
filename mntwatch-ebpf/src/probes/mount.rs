//! mount(2) programs.
//!
//! - `mount_enter` -> `syscalls/sys_enter_mount`
//! - `attach_recursive_mnt_entry` -> `attach_recursive_mnt(source_mnt, dest_mnt, dest_mp, ..)`
//! - `propagate_mnt_entry` -> `propagate_mnt(dest_mnt, dest_mp, source_mnt, ..)`
//! - `mount_exit` -> `syscalls/sys_exit_mount`

use core::mem::offset_of;

use aya_ebpf::{
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::{debug, warn};
use mntwatch_common::{Delivery, Exit, KernelPtr, MountAttach};

use super::maps::EVENTS;
use super::syscall_types::SysEnterMount;
use super::{RingBufSink, current_task, kernel_ptr_args, syscall_exit, with_probes};

#[tracepoint]
pub fn mount_enter(ctx: TracePointContext) -> u32 {
    let tid = current_task().tid;
    let fstype: u64 = unsafe { ctx.read_at(offset_of!(SysEnterMount, fs_type)) }.unwrap_or(0);

    if with_probes(|probes| probes.enter_mount(tid, fstype)).is_err() {
        debug!(&ctx, "syscall cache full, mount on tid {} not tracked", tid);
    }
    0
}

#[kprobe]
pub fn attach_recursive_mnt_entry(ctx: ProbeContext) -> u32 {
    on_attach(&ctx, MountAttach::recursive)
}

#[kprobe]
pub fn propagate_mnt_entry(ctx: ProbeContext) -> u32 {
    on_attach(&ctx, MountAttach::propagated)
}

#[inline(always)]
fn on_attach<F>(ctx: &ProbeContext, decode: F) -> u32
where
    F: FnOnce([KernelPtr; 3]) -> MountAttach,
{
    let tid = current_task().tid;
    let attach = decode(kernel_ptr_args(ctx));
    with_probes(|probes| probes.attach(tid, attach));
    0
}

#[tracepoint]
pub fn mount_exit(ctx: TracePointContext) -> u32 {
    let exit = syscall_exit(&ctx);
    let outcome = with_probes(|probes| probes.exit_mount(&exit, &RingBufSink(&EVENTS)));

    match outcome {
        Exit::Handled(Delivery::Dropped) => {
            warn!(
                &ctx,
                "event ring buffer full, mount event from pid {} lost",
                exit.task.pid
            );
        }
        Exit::Handled(Delivery::Filtered) => {
            debug!(
                &ctx,
                "mount event from pid {} filtered (retval {})",
                exit.task.pid,
                exit.retval
            );
        }
        _ => {}
    }
    0
}
