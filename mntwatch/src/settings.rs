use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use mntwatch_common::{KernelOffsets, ProbeConfig};
use serde::Deserialize;

const DEFAULT_PROC_CACHE_REFRESH_SECS: u64 = 30;
const DEFAULT_DENTRY_CACHE_SIZE: u64 = 1024;

/// Which syscalls to trace.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProbeSettings {
    pub mount: Option<bool>,
    pub umount: Option<bool>,
    /// Deliver mounts that returned an error but still produced a mount id.
    pub report_failed_mounts: Option<bool>,
}

/// Per-field overrides of [`KernelOffsets`] for kernels whose layout differs
/// from the built-in defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct KernelOffsetOverrides {
    pub mount_mnt: Option<u32>,
    pub mount_id: Option<u32>,
    pub mount_group_id: Option<u32>,
    pub vfsmount_root: Option<u32>,
    pub vfsmount_sb: Option<u32>,
    pub super_block_dev: Option<u32>,
    pub mountpoint_dentry: Option<u32>,
    pub dentry_parent: Option<u32>,
    pub dentry_name: Option<u32>,
    pub dentry_inode: Option<u32>,
    pub inode_ino: Option<u32>,
    pub qstr_len: Option<u32>,
    pub qstr_name: Option<u32>,
}

impl KernelOffsetOverrides {
    pub fn apply(&self, base: KernelOffsets) -> KernelOffsets {
        KernelOffsets {
            mount_mnt: self.mount_mnt.unwrap_or(base.mount_mnt),
            mount_id: self.mount_id.unwrap_or(base.mount_id),
            mount_group_id: self.mount_group_id.unwrap_or(base.mount_group_id),
            vfsmount_root: self.vfsmount_root.unwrap_or(base.vfsmount_root),
            vfsmount_sb: self.vfsmount_sb.unwrap_or(base.vfsmount_sb),
            super_block_dev: self.super_block_dev.unwrap_or(base.super_block_dev),
            mountpoint_dentry: self.mountpoint_dentry.unwrap_or(base.mountpoint_dentry),
            dentry_parent: self.dentry_parent.unwrap_or(base.dentry_parent),
            dentry_name: self.dentry_name.unwrap_or(base.dentry_name),
            dentry_inode: self.dentry_inode.unwrap_or(base.dentry_inode),
            inode_ino: self.inode_ino.unwrap_or(base.inode_ino),
            qstr_len: self.qstr_len.unwrap_or(base.qstr_len),
            qstr_name: self.qstr_name.unwrap_or(base.qstr_name),
            _pad: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputSettings {
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProcCacheSettings {
    pub enabled: Option<bool>,
    pub refresh_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub probes: ProbeSettings,
    #[serde(default)]
    pub kernel_offsets: KernelOffsetOverrides,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub proc_cache: ProcCacheSettings,
    pub dentry_cache_size: Option<u64>,
}

impl Settings {
    /// Environment (after `.env`) layered over an optional YAML file.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn mount_enabled(&self) -> bool {
        self.probes.mount.unwrap_or(true)
    }

    pub fn umount_enabled(&self) -> bool {
        self.probes.umount.unwrap_or(true)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig::new(self.probes.report_failed_mounts.unwrap_or(true))
    }

    pub fn kernel_offsets(&self) -> KernelOffsets {
        self.kernel_offsets.apply(KernelOffsets::DEFAULT)
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output.format.unwrap_or_default()
    }

    /// `None` when process cache seeding is disabled.
    pub fn proc_cache_refresh(&self) -> Option<Duration> {
        if !self.proc_cache.enabled.unwrap_or(true) {
            return None;
        }
        let secs = self
            .proc_cache
            .refresh_secs
            .unwrap_or(DEFAULT_PROC_CACHE_REFRESH_SECS)
            .max(1);
        Some(Duration::from_secs(secs))
    }

    pub fn dentry_cache_size(&self) -> u64 {
        self.dentry_cache_size.unwrap_or(DEFAULT_DENTRY_CACHE_SIZE)
    }
}
