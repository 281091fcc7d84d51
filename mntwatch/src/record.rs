//! Decoding and rendering of ring-buffer records.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use mntwatch_common::{EventHeader, EventType, MountEvent, PathKey, ProcessContext, UmountEvent};
use serde::Serialize;
use thiserror::Error;

use crate::dentry::{DentryResolver, PathSource};
use crate::settings::OutputFormat;
use crate::telemetry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record of {len} bytes has no header")]
    MissingHeader { len: usize },
    #[error("unknown event type {0}")]
    UnknownType(u32),
    #[error("{kind:?} record truncated: {len} of {expected} bytes")]
    Truncated {
        kind: EventType,
        len: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Mount(MountEvent),
    Umount(UmountEvent),
}

fn read_record<T: bytemuck::Pod>(bytes: &[u8], kind: EventType) -> Result<T, DecodeError> {
    let expected = size_of::<T>();
    bytes
        .get(..expected)
        .map(bytemuck::pod_read_unaligned)
        .ok_or(DecodeError::Truncated {
            kind,
            len: bytes.len(),
            expected,
        })
}

/// Decode one raw record by its header type.
pub fn decode(bytes: &[u8]) -> Result<Event, DecodeError> {
    let raw = EventHeader::raw_type(bytes)
        .ok_or(DecodeError::MissingHeader { len: bytes.len() })?;

    match EventType::try_from(raw).map_err(DecodeError::UnknownType)? {
        EventType::Mount => read_record(bytes, EventType::Mount).map(Event::Mount),
        EventType::Umount => read_record(bytes, EventType::Umount).map(Event::Umount),
    }
}

/// Converts `bpf_ktime_get_ns` timestamps to wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    /// Wall-clock nanoseconds at monotonic zero.
    boot_ns: i64,
}

impl BootClock {
    pub fn new(boot_ns: i64) -> Self {
        Self { boot_ns }
    }

    /// Sample `CLOCK_REALTIME - CLOCK_MONOTONIC` now.
    pub fn now() -> Self {
        fn read(clock: libc::clockid_t) -> i64 {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            unsafe { libc::clock_gettime(clock, &mut ts) };
            ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
        }
        Self::new(read(libc::CLOCK_REALTIME) - read(libc::CLOCK_MONOTONIC))
    }

    pub fn wall_time(&self, monotonic_ns: u64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.boot_ns.saturating_add(monotonic_ns as i64))
    }
}

/// Kernel-internal `dev_t` as `major:minor`.
pub fn format_device(dev: u32) -> String {
    format!("{}:{}", dev >> 20, dev & 0xfffff)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub cgroup_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub numlower: u32,
}

impl ProcessRecord {
    fn new(process: &ProcessContext, container_id: &str) -> Self {
        Self {
            pid: process.pid,
            tid: process.tid,
            uid: process.uid,
            gid: process.gid,
            comm: process.comm().to_string(),
            cgroup_id: process.cgroup_id,
            container_id: (!container_id.is_empty()).then(|| container_id.to_string()),
            numlower: process.numlower,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    pub time: DateTime<Utc>,
    pub cpu: u32,
    pub retval: i64,
    pub process: ProcessRecord,
    pub mount_id: i32,
    pub group_id: i32,
    pub device: String,
    pub fstype: String,
    pub parent_mount_id: i32,
    pub parent_path: String,
    pub root_mount_id: i32,
    pub root_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UmountRecord {
    pub time: DateTime<Utc>,
    pub cpu: u32,
    pub retval: i64,
    pub process: ProcessRecord,
    pub mount_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Record {
    Mount(MountRecord),
    Umount(UmountRecord),
}

impl Record {
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        Ok(match format {
            OutputFormat::Text => self.to_string(),
            OutputFormat::Json => serde_json::to_string(self)?,
        })
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} comm={} uid={}", self.pid, self.comm, self.uid)?;
        if let Some(id) = &self.container_id {
            write!(f, " container={} layers={}", id, self.numlower)?;
        }
        Ok(())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Mount(m) => write!(
                f,
                "{} MOUNT id={} group={} dev={} fstype={} root={}:{} parent={}:{} ret={} {}",
                m.time.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
                m.mount_id,
                m.group_id,
                m.device,
                m.fstype,
                m.root_mount_id,
                m.root_path,
                m.parent_mount_id,
                m.parent_path,
                m.retval,
                m.process,
            ),
            Record::Umount(u) => write!(
                f,
                "{} UMOUNT id={} ret={} {}",
                u.time.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
                u.mount_id,
                u.retval,
                u.process,
            ),
        }
    }
}

/// Turns decoded events into records, resolving paths on the way.
pub struct RecordBuilder<S> {
    resolver: DentryResolver<S>,
    clock: BootClock,
}

impl<S: PathSource> RecordBuilder<S> {
    pub fn new(resolver: DentryResolver<S>, clock: BootClock) -> Self {
        Self { resolver, clock }
    }

    fn path(&self, which: &str, key: PathKey) -> String {
        match self.resolver.resolve(key.mount_id, key.ino) {
            Ok(path) => path,
            Err(e) => {
                log::debug!("Failed to resolve {} path: {}", which, e);
                telemetry::record_path_resolution_error(which);
                e.fallback_path()
            }
        }
    }

    pub fn build(&self, event: &Event) -> Record {
        match event {
            Event::Mount(m) => Record::Mount(MountRecord {
                time: self.clock.wall_time(m.header.timestamp),
                cpu: m.header.cpu,
                retval: m.header.retval,
                process: ProcessRecord::new(&m.process, m.container_id()),
                mount_id: m.new_mount_id,
                group_id: m.new_group_id,
                device: format_device(m.new_device),
                fstype: m.fstype().to_string(),
                parent_mount_id: m.parent_mount_id,
                parent_path: self.path("parent", m.parent_key()),
                root_mount_id: m.root_mount_id,
                root_path: self.path("root", m.root_key()),
            }),
            Event::Umount(u) => Record::Umount(UmountRecord {
                time: self.clock.wall_time(u.header.timestamp),
                cpu: u.header.cpu,
                retval: u.header.retval,
                process: ProcessRecord::new(&u.process, u.container_id()),
                mount_id: u.mount_id,
            }),
        }
    }
}

/// Header of a record that failed to decode, for diagnostics.
pub fn peek_header(bytes: &[u8]) -> Option<EventHeader> {
    bytes
        .get(..size_of::<EventHeader>())
        .map(bytemuck::pod_read_unaligned)
}
