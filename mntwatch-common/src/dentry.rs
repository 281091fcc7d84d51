//! Dentry ancestry registration.
//!
//! A dentry is only guaranteed to be reachable while the probe that saw it is
//! running, so its ancestry is recorded immediately: one `PathKey -> PathLeaf`
//! entry per component, walking towards the filesystem root. User space later
//! follows the `parent` links to rebuild the full path.

use bytemuck::Zeroable;

use crate::DENTRY_MAX_DEPTH;
use crate::event::{PathKey, PathLeaf};
use crate::kernel::{KernelMemory, KernelPtr, KernelView};

/// Fire-and-forget registration of a dentry's ancestry.
pub trait DentryResolver {
    fn register_dentry(&self, dentry: KernelPtr, key: PathKey, parent_hint: Option<PathKey>);
}

/// Key/value store backing the ancestry mapping (the `PATHNAMES` map).
pub trait PathStore {
    /// Returns `false` if the store refused the write.
    fn store(&self, key: &PathKey, leaf: &PathLeaf) -> bool;
}

/// Walks `d_parent` links and records each step into a [`PathStore`].
pub struct DentryWalker<'a, M, S> {
    view: KernelView<'a, M>,
    store: &'a S,
}

impl<'a, M: KernelMemory, S: PathStore> DentryWalker<'a, M, S> {
    pub fn new(view: KernelView<'a, M>, store: &'a S) -> Self {
        Self { view, store }
    }
}

impl<M: KernelMemory, S: PathStore> DentryResolver for DentryWalker<'_, M, S> {
    fn register_dentry(&self, dentry: KernelPtr, key: PathKey, parent_hint: Option<PathKey>) {
        let mut dentry = dentry;
        let mut key = key;
        let mut hint = parent_hint;

        for _ in 0..DENTRY_MAX_DEPTH {
            if dentry.is_null() || key.is_null() {
                return;
            }

            let parent = self.view.dentry_parent(dentry);
            let at_root = parent.is_null() || parent == dentry;

            let mut leaf = PathLeaf::zeroed();
            self.view.dentry_name(dentry, &mut leaf.name);
            leaf.parent = match hint.take() {
                Some(hint) => hint,
                None if at_root => PathKey::NULL,
                None => PathKey::new(key.mount_id, self.view.dentry_ino(parent)),
            };

            if !self.store.store(&key, &leaf) {
                return;
            }
            if at_root || leaf.parent.ino == 0 {
                return;
            }

            dentry = parent;
            key = leaf.parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeKernel, MemoryPathStore};

    #[test]
    fn walk_records_every_ancestor_up_to_root() {
        let mut kernel = FakeKernel::new();
        let root = kernel.add_dentry("/", 2, None);
        let var = kernel.add_dentry("var", 20, Some(root));
        let lib = kernel.add_dentry("lib", 21, Some(var));
        let store = MemoryPathStore::default();

        DentryWalker::new(kernel.view(), &store).register_dentry(lib, PathKey::new(1, 21), None);

        let leaf = store.get(&PathKey::new(1, 21)).unwrap();
        assert_eq!(leaf.name(), "lib");
        assert_eq!(leaf.parent, PathKey::new(1, 20));

        let leaf = store.get(&PathKey::new(1, 20)).unwrap();
        assert_eq!(leaf.name(), "var");
        assert_eq!(leaf.parent, PathKey::new(1, 2));

        let leaf = store.get(&PathKey::new(1, 2)).unwrap();
        assert_eq!(leaf.name(), "/");
        assert!(leaf.parent.is_null());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn repeated_registration_is_idempotent() {
        let mut kernel = FakeKernel::new();
        let root = kernel.add_dentry("/", 2, None);
        let mnt = kernel.add_dentry("mnt", 42, Some(root));
        let store = MemoryPathStore::default();
        let walker = DentryWalker::new(kernel.view(), &store);

        walker.register_dentry(mnt, PathKey::new(1, 42), None);
        let first = store.snapshot();
        walker.register_dentry(mnt, PathKey::new(1, 42), None);

        assert_eq!(store.snapshot(), first);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn parent_hint_overrides_first_parent() {
        let mut kernel = FakeKernel::new();
        let root = kernel.add_dentry("/", 2, None);
        let dir = kernel.add_dentry("data", 30, Some(root));
        let store = MemoryPathStore::default();
        let hint = PathKey::new(9, 99);

        DentryWalker::new(kernel.view(), &store).register_dentry(
            dir,
            PathKey::new(1, 30),
            Some(hint),
        );

        assert_eq!(store.get(&PathKey::new(1, 30)).unwrap().parent, hint);
    }

    #[test]
    fn null_inputs_record_nothing() {
        let mut kernel = FakeKernel::new();
        let root = kernel.add_dentry("/", 2, None);
        let store = MemoryPathStore::default();
        let walker = DentryWalker::new(kernel.view(), &store);

        walker.register_dentry(KernelPtr::NULL, PathKey::new(1, 2), None);
        walker.register_dentry(root, PathKey::NULL, None);

        assert_eq!(store.len(), 0);
    }

    #[test]
    fn deep_chains_stop_at_depth_budget() {
        let mut kernel = FakeKernel::new();
        let mut dentry = kernel.add_dentry("/", 1, None);
        for ino in 2..(DENTRY_MAX_DEPTH as u64 + 10) {
            dentry = kernel.add_dentry("d", ino, Some(dentry));
        }
        let leaf_ino = DENTRY_MAX_DEPTH as u64 + 9;
        let store = MemoryPathStore::default();

        DentryWalker::new(kernel.view(), &store).register_dentry(
            dentry,
            PathKey::new(1, leaf_ino),
            None,
        );

        assert_eq!(store.len(), DENTRY_MAX_DEPTH);
    }
}
