//! umount(2) programs.
//!
//! - `umount_enter` -> `syscalls/sys_enter_umount`
//! - `security_sb_umount_entry` -> `security_sb_umount(struct vfsmount *mnt, int flags)`
//! - `umount_exit` -> `syscalls/sys_exit_umount`

use aya_ebpf::{
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::{debug, warn};
use mntwatch_common::{Delivery, Exit, KernelPtr};

use super::maps::EVENTS;
use super::{RingBufSink, current_task, syscall_exit, with_probes};

#[tracepoint]
pub fn umount_enter(ctx: TracePointContext) -> u32 {
    let tid = current_task().tid;
    if with_probes(|probes| probes.enter_umount(tid)).is_err() {
        debug!(&ctx, "syscall cache full, umount on tid {} not tracked", tid);
    }
    0
}

#[kprobe]
pub fn security_sb_umount_entry(ctx: ProbeContext) -> u32 {
    let tid = current_task().tid;
    let vfsmnt = KernelPtr(ctx.arg::<u64>(0).unwrap_or(0));
    with_probes(|probes| probes.sb_umount(tid, vfsmnt));
    0
}

#[tracepoint]
pub fn umount_exit(ctx: TracePointContext) -> u32 {
    let exit = syscall_exit(&ctx);
    let outcome = with_probes(|probes| probes.exit_umount(&exit, &RingBufSink(&EVENTS)));

    match outcome {
        Exit::Handled(Delivery::Dropped) => {
            warn!(
                &ctx,
                "event ring buffer full, umount event from pid {} lost",
                exit.task.pid
            );
        }
        Exit::Handled(Delivery::Filtered) => {
            debug!(
                &ctx,
                "umount event from pid {} filtered (retval {})",
                exit.task.pid,
                exit.retval
            );
        }
        _ => {}
    }
    0
}
