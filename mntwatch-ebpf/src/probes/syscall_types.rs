/// Common tracepoint header for syscall events (sys_enter_*, sys_exit_*)
#[repr(C)]
#[allow(dead_code)]
pub struct SyscallTraceHeader {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
    pub __syscall_nr: i32,
    pub _pad: i32,
}

/// `syscalls/sys_enter_mount`
#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterMount {
    pub header: SyscallTraceHeader,
    pub dev_name: u64,
    pub dir_name: u64,
    pub fs_type: u64,
    pub flags: u64,
    pub data: u64,
}

/// Shared by every `sys_exit_*` tracepoint.
#[repr(C)]
#[allow(dead_code)]
pub struct SysExit {
    pub header: SyscallTraceHeader,
    pub ret: i64,
}
