//! Process/container context collaborator.

use crate::CONTAINER_ID_LEN;
use crate::event::{ProcCacheEntry, ProcessContext};

/// Thread identity of the probed task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId {
    /// Thread group id (the user-visible pid).
    pub pid: u32,
    pub tid: u32,
}

impl TaskId {
    /// Split the value returned by `bpf_get_current_pid_tgid`.
    pub fn from_pid_tgid(pid_tgid: u64) -> Self {
        Self {
            pid: (pid_tgid >> 32) as u32,
            tid: pid_tgid as u32,
        }
    }
}

pub trait ProcessContextProvider {
    /// Always succeeds; fields the provider cannot read stay zeroed.
    fn fill_process_data(&self, task: TaskId) -> ProcessContext;

    /// Container context previously cached for `pid`, if any.
    fn lookup_process_cache(&self, pid: u32) -> Option<ProcCacheEntry>;
}

/// Copy cached container context into an event. Best effort: returns `false`
/// and leaves the fields untouched when nothing is cached for `pid`.
#[inline(always)]
pub(crate) fn enrich<P: ProcessContextProvider>(
    procs: &P,
    pid: u32,
    container_id: &mut [u8; CONTAINER_ID_LEN],
    process: &mut ProcessContext,
) -> bool {
    match procs.lookup_process_cache(pid) {
        Some(entry) => {
            *container_id = entry.container_id;
            process.numlower = entry.numlower;
            true
        }
        None => false,
    }
}
