//! Path reconstruction from the `PATHNAMES` map.
//!
//! The BPF side stores one `PathKey -> PathLeaf` entry per path component.
//! Rebuilding a path means following `parent` links until the filesystem root,
//! whose parent inode is zero.

use std::borrow::Borrow;

use aya::maps::{HashMap, MapData};
use mntwatch_common::{PathKey, PathLeaf};
use moka::sync::Cache;
use thiserror::Error;

/// Prefix of paths whose ancestry could only be partially rebuilt.
pub const ERROR_PREFIX: &str = "*ERROR*";

/// Guard against parent cycles in a corrupted map.
const MAX_PATH_COMPONENTS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DentryError {
    #[error("invalid inode/mount id couple: {0}")]
    NullKey(PathKey),
    #[error("no path leaf for {missing} (resolved so far: {partial:?})")]
    Incomplete { missing: PathKey, partial: String },
    #[error("path for {0} has more than {MAX_PATH_COMPONENTS} components")]
    TooDeep(PathKey),
}

impl DentryError {
    /// What to show in place of the path.
    pub fn fallback_path(&self) -> String {
        match self {
            DentryError::NullKey(_) => String::new(),
            DentryError::Incomplete { partial, .. } => format!("{ERROR_PREFIX}{partial}"),
            DentryError::TooDeep(_) => ERROR_PREFIX.to_string(),
        }
    }
}

/// Read access to stored path leaves.
pub trait PathSource {
    fn leaf(&self, key: &PathKey) -> Option<PathLeaf>;
}

impl<T: Borrow<MapData>> PathSource for HashMap<T, PathKey, PathLeaf> {
    fn leaf(&self, key: &PathKey) -> Option<PathLeaf> {
        self.get(key, 0).ok()
    }
}

pub struct DentryResolver<S> {
    source: S,
    leaves: Cache<PathKey, PathLeaf>,
}

impl<S: PathSource> DentryResolver<S> {
    pub fn new(source: S, capacity: u64) -> Self {
        Self {
            source,
            leaves: Cache::new(capacity),
        }
    }

    fn lookup(&self, key: &PathKey) -> Option<PathLeaf> {
        if let Some(leaf) = self.leaves.get(key) {
            return Some(leaf);
        }
        let leaf = self.source.leaf(key)?;
        self.leaves.insert(*key, leaf);
        Some(leaf)
    }

    /// Absolute path of `(mount_id, ino)` relative to its mount's root.
    pub fn resolve(&self, mount_id: u32, ino: u64) -> Result<String, DentryError> {
        let start = PathKey::new(mount_id, ino);
        if start.is_null() {
            return Err(DentryError::NullKey(start));
        }

        let mut components: Vec<String> = Vec::new();
        let mut key = start;

        for _ in 0..MAX_PATH_COMPONENTS {
            let Some(leaf) = self.lookup(&key) else {
                return Err(DentryError::Incomplete {
                    missing: key,
                    partial: join(&components),
                });
            };

            let name = leaf.name();
            // The root dentry is named "/" and contributes no component.
            if !name.is_empty() && !name.starts_with('/') {
                components.push(name.to_string());
            }

            if leaf.parent.ino == 0 {
                let path = join(&components);
                return Ok(if path.is_empty() { "/".to_string() } else { path });
            }
            key = leaf.parent;
        }

        Err(DentryError::TooDeep(start))
    }
}

/// Components are collected leaf first.
fn join(components: &[String]) -> String {
    components.iter().rev().fold(String::new(), |mut path, c| {
        path.push('/');
        path.push_str(c);
        path
    })
}
