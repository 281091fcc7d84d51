//! Umount syscall state and event assembly.

use crate::event::{EventHeader, EventType, UmountEvent};
use crate::kernel::{KernelMemory, KernelPtr, KernelView};
use crate::probe::SyscallExit;
use crate::process::{ProcessContextProvider, enrich};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UmountState {
    /// `struct vfsmount *` handed to `security_sb_umount`.
    pub vfsmnt: KernelPtr,
}

impl UmountState {
    /// Record the vfsmount being detached. First writer wins.
    pub fn record(&mut self, vfsmnt: KernelPtr) -> bool {
        if !self.vfsmnt.is_null() || vfsmnt.is_null() {
            return false;
        }
        self.vfsmnt = vfsmnt;
        true
    }

    pub fn assemble<M, P>(
        &self,
        event: &mut UmountEvent,
        exit: &SyscallExit,
        view: KernelView<'_, M>,
        procs: &P,
    ) -> bool
    where
        M: KernelMemory,
        P: ProcessContextProvider,
    {
        let mount_id = view.mount_id(view.vfsmount_mount(self.vfsmnt));
        if mount_id == 0 {
            return false;
        }

        event.header = EventHeader {
            event_type: EventType::Umount as u32,
            cpu: exit.cpu,
            timestamp: exit.timestamp,
            retval: exit.retval,
        };
        event.mount_id = mount_id;
        event.process = procs.fill_process_data(exit.task);
        enrich(procs, exit.task.pid, &mut event.container_id, &mut event.process);

        true
    }
}
