//! Fixed-layout records shared between the BPF programs and user space.
//!
//! All integer fields are native byte order. Layouts carry explicit padding so
//! they derive `Pod` and decode the same way on both sides of the boundary.

use bytemuck::{Pod, Zeroable};

use crate::{CONTAINER_ID_LEN, DENTRY_NAME_LEN, FSTYPE_LEN, TASK_COMM_LEN, c_str};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Mount = 1,
    Umount = 2,
}

impl TryFrom<u32> for EventType {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(EventType::Mount),
            2 => Ok(EventType::Umount),
            other => Err(other),
        }
    }
}

/// Generic header leading every delivered record.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct EventHeader {
    pub event_type: u32,
    pub cpu: u32,
    /// Monotonic kernel time in nanoseconds.
    pub timestamp: u64,
    /// The syscall's actual return value.
    pub retval: i64,
}

impl EventHeader {
    /// Raw `event_type` of a record, read without decoding the rest of it.
    /// `None` when the record is too short to hold one.
    pub fn raw_type(bytes: &[u8]) -> Option<u32> {
        let raw = bytes.get(..size_of::<u32>())?;
        Some(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct ProcessContext {
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Number of overlay lower layers inherited from the process cache.
    pub numlower: u32,
    pub _pad: u32,
    pub cgroup_id: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl ProcessContext {
    pub fn comm(&self) -> &str {
        c_str(&self.comm)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct MountEvent {
    pub header: EventHeader,
    pub process: ProcessContext,
    pub container_id: [u8; CONTAINER_ID_LEN],
    pub new_mount_id: i32,
    pub new_group_id: i32,
    pub new_device: u32,
    pub parent_mount_id: i32,
    pub parent_ino: u64,
    pub root_ino: u64,
    pub root_mount_id: i32,
    pub padding: u32,
    pub fstype: [u8; FSTYPE_LEN],
}

impl MountEvent {
    pub fn fstype(&self) -> &str {
        c_str(&self.fstype)
    }

    pub fn container_id(&self) -> &str {
        c_str(&self.container_id)
    }

    pub fn root_key(&self) -> PathKey {
        PathKey::new(self.root_mount_id as u32, self.root_ino)
    }

    pub fn parent_key(&self) -> PathKey {
        PathKey::new(self.parent_mount_id as u32, self.parent_ino)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct UmountEvent {
    pub header: EventHeader,
    pub process: ProcessContext,
    pub container_id: [u8; CONTAINER_ID_LEN],
    pub mount_id: i32,
    pub padding: u32,
}

impl UmountEvent {
    pub fn container_id(&self) -> &str {
        c_str(&self.container_id)
    }
}

/// (mount id, inode) pair identifying a filesystem object.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, Default, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub ino: u64,
    pub mount_id: u32,
    pub _pad: u32,
}

impl PathKey {
    pub const NULL: PathKey = PathKey {
        ino: 0,
        mount_id: 0,
        _pad: 0,
    };

    pub const fn new(mount_id: u32, ino: u64) -> Self {
        Self {
            ino,
            mount_id,
            _pad: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ino == 0 && self.mount_id == 0
    }
}

impl core::fmt::Display for PathKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:x}/{:x}", self.mount_id, self.ino)
    }
}

/// One step of a dentry's ancestry: its name and the key of its parent.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct PathLeaf {
    pub parent: PathKey,
    pub name: [u8; DENTRY_NAME_LEN],
}

impl PathLeaf {
    pub fn name(&self) -> &str {
        c_str(&self.name)
    }
}

/// Container context cached per process, seeded from user space.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct ProcCacheEntry {
    pub container_id: [u8; CONTAINER_ID_LEN],
    pub numlower: u32,
    pub _pad: u32,
}

impl ProcCacheEntry {
    /// Build an entry, truncating the container id to the record's capacity.
    /// A full-length id is stored without terminator.
    pub fn new(container_id: &str, numlower: u32) -> Self {
        let mut entry = Self::zeroed();
        let bytes = container_id.as_bytes();
        let len = bytes.len().min(CONTAINER_ID_LEN);
        entry.container_id[..len].copy_from_slice(&bytes[..len]);
        entry.numlower = numlower;
        entry
    }

    pub fn container_id(&self) -> &str {
        c_str(&self.container_id)
    }
}

/// Runtime knobs pushed to the `PROBE_CONFIG` map.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub report_failed_mounts: u8,
    pub _pad: [u8; 7],
}

impl ProbeConfig {
    pub const DEFAULT: ProbeConfig = ProbeConfig {
        report_failed_mounts: 1,
        _pad: [0; 7],
    };

    pub fn new(report_failed_mounts: bool) -> Self {
        Self {
            report_failed_mounts: report_failed_mounts as u8,
            ..Self::DEFAULT
        }
    }

    pub fn report_failed_mounts(&self) -> bool {
        self.report_failed_mounts != 0
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(feature = "user")]
mod pod {
    use super::*;

    unsafe impl aya::Pod for MountEvent {}
    unsafe impl aya::Pod for UmountEvent {}
    unsafe impl aya::Pod for PathKey {}
    unsafe impl aya::Pod for PathLeaf {}
    unsafe impl aya::Pod for ProcCacheEntry {}
    unsafe impl aya::Pod for ProbeConfig {}
}
