//! Seeding of the kernel-side `PROC_CACHE` map.
//!
//! The BPF programs copy a process's container id and overlay layer count into
//! each event, but cannot compute either themselves. User space walks `/proc`
//! at start-up and on a fixed interval and publishes one entry per
//! containerized process.

use std::{borrow::BorrowMut, collections::HashSet, time::Duration};

use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData};
use log::{debug, info, warn};
use mntwatch_common::ProcCacheEntry;
use procfs::process::{MountInfo, Process};

use crate::probes::shutdown_requested;

/// Extract a container ID from the path part of a cgroup line.
///
/// Supports the layouts used by docker, containerd and kubelet:
/// - plain: `/kubepods/besteffort/pod<uid>/<64-hex-container-id>`
/// - systemd scope: `cri-containerd-<64hex>.scope` or `docker-<64hex>.scope`
pub fn parse_container_id_from_cgroup_path(path: &str) -> Option<String> {
    // Skip paths that don't look like container cgroups
    if !path.contains("kubepods") && !path.contains("docker") && !path.contains("containerd") {
        return None;
    }

    let last_segment = path.rsplit('/').next()?;

    if let Some(inner) = last_segment.strip_suffix(".scope")
        && let Some(hex_id) = inner.rsplit('-').next()
        && is_container_id(hex_id)
    {
        return Some(hex_id.to_string());
    }

    if is_container_id(last_segment) {
        return Some(last_segment.to_string());
    }

    None
}

/// Check if a string looks like a 64-char hex container ID.
fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Number of layers in an overlayfs `lowerdir=` option.
pub fn count_lower_layers(lowerdir: &str) -> u32 {
    lowerdir.split(':').filter(|layer| !layer.is_empty()).count() as u32
}

/// Lower layer count of the overlay mounted at `/` in a mount table.
pub fn overlay_root_layers<'a>(mounts: impl IntoIterator<Item = &'a MountInfo>) -> u32 {
    mounts
        .into_iter()
        .find(|m| m.fs_type == "overlay" && m.mount_point.as_os_str() == "/")
        .and_then(|m| m.super_options.get("lowerdir").cloned().flatten())
        .map(|lowerdir| count_lower_layers(&lowerdir))
        .unwrap_or(0)
}

/// Container context of one process, `None` when it is not containerized or
/// has already exited.
fn inspect(process: &Process) -> Option<ProcCacheEntry> {
    let container_id = process
        .cgroups()
        .ok()?
        .0
        .into_iter()
        .find_map(|cg| parse_container_id_from_cgroup_path(&cg.pathname))?;

    let numlower = match process.mountinfo() {
        Ok(mounts) => overlay_root_layers(mounts.0.iter()),
        Err(_) => 0,
    };

    Some(ProcCacheEntry::new(&container_id, numlower))
}

/// Current container context of every process under `/proc`.
pub fn scan() -> Result<Vec<(u32, ProcCacheEntry)>> {
    let processes = procfs::process::all_processes().context("Failed to list /proc")?;

    Ok(processes
        .filter_map(|p| p.ok())
        .filter_map(|p| {
            let pid = u32::try_from(p.pid()).ok()?;
            inspect(&p).map(|entry| (pid, entry))
        })
        .collect())
}

/// Destination of the scanned entries, keyed by tgid.
pub trait ProcCacheMap {
    fn publish(&mut self, pid: u32, entry: &ProcCacheEntry) -> Result<()>;
    fn retract(&mut self, pid: u32) -> Result<()>;
}

impl<T: BorrowMut<MapData>> ProcCacheMap for HashMap<T, u32, ProcCacheEntry> {
    fn publish(&mut self, pid: u32, entry: &ProcCacheEntry) -> Result<()> {
        Ok(self.insert(pid, entry, 0)?)
    }

    fn retract(&mut self, pid: u32) -> Result<()> {
        Ok(self.remove(&pid)?)
    }
}

pub struct ProcCacheSeeder<M> {
    map: M,
    published: HashSet<u32>,
}

impl<M: ProcCacheMap> ProcCacheSeeder<M> {
    pub fn new(map: M) -> Self {
        Self {
            map,
            published: HashSet::new(),
        }
    }

    /// Publish the current scan and retract processes that are gone.
    /// Returns the number of published entries.
    pub fn refresh(&mut self) -> Result<usize> {
        Ok(self.apply(&scan()?))
    }

    /// Only processes missing from `entries` are retracted. A process whose
    /// update failed keeps its previous entry.
    fn apply(&mut self, entries: &[(u32, ProcCacheEntry)]) -> usize {
        let alive: HashSet<u32> = entries.iter().map(|(pid, _)| *pid).collect();

        let mut updated = 0;
        for (pid, entry) in entries {
            match self.map.publish(*pid, entry) {
                Ok(()) => updated += 1,
                Err(e) => warn!("Failed to cache container context for pid {}: {:#}", pid, e),
            }
        }

        for pid in self.published.difference(&alive) {
            // The kernel-side LRU may already have evicted it.
            let _ = self.map.retract(*pid);
        }

        debug!(
            "Process cache refreshed: {} of {} containerized processes",
            updated,
            alive.len()
        );
        self.published = alive;
        updated
    }

    /// Refresh periodically until shutdown.
    pub fn spawn(mut self, every: Duration)
    where
        M: Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if shutdown_requested() {
                    break;
                }
                if let Err(e) = self.refresh() {
                    warn!("Process cache refresh failed: {:#}", e);
                }
            }
            info!("Process cache refresher stopped");
        });
    }
}
