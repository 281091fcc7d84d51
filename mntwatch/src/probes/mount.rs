//! mount(2) / umount(2) probes.
//!
//! Kernel-function probes are attached before the exit tracepoint, and the
//! exit before the entry, so that no correlation entry is ever created without
//! the programs that complete it.

use anyhow::Result;
use aya::Ebpf;
use log::info;

use crate::probes::{Hook, Probe, attach_hooks};
use crate::telemetry;

const MOUNT_HOOKS: [Hook; 4] = [
    Hook::KProbe {
        program: "attach_recursive_mnt_entry",
        function: "attach_recursive_mnt",
    },
    Hook::KProbe {
        program: "propagate_mnt_entry",
        function: "propagate_mnt",
    },
    Hook::syscall("mount_exit", "sys_exit_mount"),
    Hook::syscall("mount_enter", "sys_enter_mount"),
];

const UMOUNT_HOOKS: [Hook; 3] = [
    Hook::KProbe {
        program: "security_sb_umount_entry",
        function: "security_sb_umount",
    },
    Hook::syscall("umount_exit", "sys_exit_umount"),
    Hook::syscall("umount_enter", "sys_enter_umount"),
];

fn attach_named(bpf: &mut Ebpf, name: &str, hooks: &[Hook]) -> Result<u64> {
    let attached = attach_hooks(bpf, hooks)?;
    telemetry::record_active_probe(name, attached);
    info!("{} probe attached ({} of {} programs)", name, attached, hooks.len());
    Ok(attached)
}

pub struct MountProbe;

impl Probe for MountProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<u64> {
        attach_named(bpf, "mount", &MOUNT_HOOKS)
    }
}

pub struct UmountProbe;

impl Probe for UmountProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<u64> {
        attach_named(bpf, "umount", &UMOUNT_HOOKS)
    }
}
