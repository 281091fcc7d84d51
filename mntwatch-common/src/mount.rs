//! Mount syscall state and event assembly.

use crate::dentry::DentryResolver;
use crate::event::{EventHeader, EventType, MountEvent, PathKey, ProbeConfig};
use crate::kernel::{KernelMemory, KernelPtr, KernelView};
use crate::probe::SyscallExit;
use crate::process::{ProcessContextProvider, enrich};

/// Accumulated state of one in-flight `mount(2)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountState {
    /// User-space address of the `filesystemtype` argument. Only read at
    /// exit time.
    pub fstype: u64,
    pub src_mnt: KernelPtr,
    pub dest_mnt: KernelPtr,
    pub dest_mountpoint: KernelPtr,
    pub root_key: PathKey,
}

/// The three kernel objects identifying an attach, whichever internal path
/// reported them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountAttach {
    pub source: KernelPtr,
    pub dest: KernelPtr,
    pub mountpoint: KernelPtr,
}

impl MountAttach {
    /// `attach_recursive_mnt(source_mnt, dest_mnt, dest_mp, ...)`
    pub fn recursive(args: [KernelPtr; 3]) -> Self {
        let [source, dest, mountpoint] = args;
        Self {
            source,
            dest,
            mountpoint,
        }
    }

    /// `propagate_mnt(dest_mnt, dest_mp, source_mnt, ...)`
    pub fn propagated(args: [KernelPtr; 3]) -> Self {
        let [dest, mountpoint, source] = args;
        Self {
            source,
            dest,
            mountpoint,
        }
    }
}

impl MountState {
    pub fn new(fstype: u64) -> Self {
        Self {
            fstype,
            ..Self::default()
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.src_mnt.is_null()
    }

    /// Record the mount pair and resolve the source root. The first attach
    /// wins; later reports of the same operation are ignored.
    ///
    /// The source root dentry is registered right away since it may no longer
    /// be reachable once the syscall returns.
    pub fn attach<M, R>(
        &mut self,
        attach: MountAttach,
        view: KernelView<'_, M>,
        resolver: &R,
    ) -> bool
    where
        M: KernelMemory,
        R: DentryResolver,
    {
        if self.is_attached() || attach.source.is_null() {
            return false;
        }

        self.src_mnt = attach.source;
        self.dest_mnt = attach.dest;
        self.dest_mountpoint = attach.mountpoint;

        let root = view.mount_root_dentry(attach.source);
        self.root_key = PathKey::new(view.mount_id(attach.source) as u32, view.dentry_ino(root));
        resolver.register_dentry(root, self.root_key, None);

        true
    }

    /// Fill `event` from the accumulated state. Returns `false` when the
    /// event must not be delivered.
    pub fn assemble<M, R, P>(
        &self,
        event: &mut MountEvent,
        exit: &SyscallExit,
        view: KernelView<'_, M>,
        resolver: &R,
        procs: &P,
        config: &ProbeConfig,
    ) -> bool
    where
        M: KernelMemory,
        R: DentryResolver,
        P: ProcessContextProvider,
    {
        let mountpoint = view.mountpoint_dentry(self.dest_mountpoint);
        let parent_key = PathKey::new(
            view.mount_id(self.dest_mnt) as u32,
            view.dentry_ino(mountpoint),
        );

        event.header = EventHeader {
            event_type: EventType::Mount as u32,
            cpu: exit.cpu,
            timestamp: exit.timestamp,
            retval: exit.retval,
        };
        event.new_mount_id = view.mount_id(self.src_mnt);
        event.new_group_id = view.mount_peer_group_id(self.src_mnt);
        event.new_device = view.mount_dev(self.src_mnt);
        event.parent_mount_id = parent_key.mount_id as i32;
        event.parent_ino = parent_key.ino;
        event.root_ino = self.root_key.ino;
        event.root_mount_id = self.root_key.mount_id as i32;
        view.memory().read_user_str(self.fstype, &mut event.fstype);

        // No attach probe fired: the operation produced no mount.
        if event.new_mount_id == 0 && event.new_device == 0 {
            return false;
        }
        if exit.retval < 0 && !config.report_failed_mounts() {
            return false;
        }

        event.process = procs.fill_process_data(exit.task);
        resolver.register_dentry(mountpoint, parent_key, None);
        enrich(procs, exit.task.pid, &mut event.container_id, &mut event.process);

        true
    }
}
