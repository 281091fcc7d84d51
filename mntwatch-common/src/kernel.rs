//! Offset-based navigation of kernel VFS structures.
//!
//! BPF programs only ever see raw kernel addresses. [`KernelView`] turns a
//! `struct mount *`, `struct mountpoint *` or `struct dentry *` into the
//! identifiers we report, using [`KernelOffsets`] and a fault-tolerant
//! [`KernelMemory`] reader. Every accessor degrades to zero / null when a read
//! fails; nothing here can abort a probe.

use bytemuck::{Pod, Zeroable};

/// Opaque kernel object address. Never dereferenced directly.
#[repr(transparent)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, Default, PartialEq, Eq, Hash)]
pub struct KernelPtr(pub u64);

impl KernelPtr {
    pub const NULL: KernelPtr = KernelPtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, offset: u32) -> KernelPtr {
        KernelPtr(self.0.wrapping_add(offset as u64))
    }

    pub fn sub(self, offset: u32) -> KernelPtr {
        KernelPtr(self.0.wrapping_sub(offset as u64))
    }
}

/// Result of a bounded, fault-tolerant string copy.
///
/// A string is only `Complete` when its terminator lands before the last
/// byte of the destination. A string of exactly `dst.len() - 1` bytes fills
/// the buffer and reports `Truncated(dst.len())`, since the copy cannot tell
/// it apart from a longer one that was cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The string and its terminator fit; carries the length including NUL.
    Complete(usize),
    /// The destination filled up; the last byte holds the forced NUL.
    Truncated(usize),
    /// The source was unreadable; the destination is zeroed.
    Faulted,
}

/// Fault-tolerant access to kernel and user memory.
pub trait KernelMemory {
    /// Copy a `T` out of kernel memory, or `None` if the address faults.
    fn read<T: Pod>(&self, addr: KernelPtr) -> Option<T>;

    /// Copy a NUL-terminated string from the traced process's memory.
    fn read_user_str(&self, addr: u64, dst: &mut [u8]) -> ReadOutcome;

    /// Copy a NUL-terminated string from kernel memory.
    fn read_kernel_str(&self, addr: KernelPtr, dst: &mut [u8]) -> ReadOutcome;
}

/// Byte offsets of the kernel structure fields we navigate.
///
/// Defaults match x86_64 Linux 5.x builds. Every field can be overridden from
/// configuration and is pushed to the `KERNEL_OFFSETS` map at start-up.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug, PartialEq, Eq)]
pub struct KernelOffsets {
    /// `struct mount.mnt` (the embedded `struct vfsmount`).
    pub mount_mnt: u32,
    pub mount_id: u32,
    pub mount_group_id: u32,
    pub vfsmount_root: u32,
    pub vfsmount_sb: u32,
    pub super_block_dev: u32,
    pub mountpoint_dentry: u32,
    pub dentry_parent: u32,
    /// `struct dentry.d_name` (a `struct qstr`).
    pub dentry_name: u32,
    pub dentry_inode: u32,
    pub inode_ino: u32,
    pub qstr_len: u32,
    pub qstr_name: u32,
    pub _pad: u32,
}

impl KernelOffsets {
    pub const DEFAULT: KernelOffsets = KernelOffsets {
        mount_mnt: 32,
        mount_id: 284,
        mount_group_id: 288,
        vfsmount_root: 0,
        vfsmount_sb: 8,
        super_block_dev: 16,
        mountpoint_dentry: 16,
        dentry_parent: 24,
        dentry_name: 32,
        dentry_inode: 48,
        inode_ino: 64,
        qstr_len: 4,
        qstr_name: 8,
        _pad: 0,
    };
}

impl Default for KernelOffsets {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for KernelOffsets {}

/// Typed accessors over raw kernel addresses.
pub struct KernelView<'a, M> {
    mem: &'a M,
    offsets: &'a KernelOffsets,
}

impl<M> Clone for KernelView<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for KernelView<'_, M> {}

impl<'a, M: KernelMemory> KernelView<'a, M> {
    pub fn new(mem: &'a M, offsets: &'a KernelOffsets) -> Self {
        Self { mem, offsets }
    }

    pub fn memory(&self) -> &'a M {
        self.mem
    }

    #[inline(always)]
    fn field<T: Pod + Default>(&self, base: KernelPtr, offset: u32) -> T {
        if base.is_null() {
            return T::default();
        }
        self.mem.read(base.add(offset)).unwrap_or_default()
    }

    /// `&mount->mnt`
    pub fn mount_vfsmount(&self, mnt: KernelPtr) -> KernelPtr {
        if mnt.is_null() {
            return KernelPtr::NULL;
        }
        mnt.add(self.offsets.mount_mnt)
    }

    /// `container_of(vfsmnt, struct mount, mnt)`
    pub fn vfsmount_mount(&self, vfsmnt: KernelPtr) -> KernelPtr {
        if vfsmnt.is_null() {
            return KernelPtr::NULL;
        }
        vfsmnt.sub(self.offsets.mount_mnt)
    }

    pub fn mount_id(&self, mnt: KernelPtr) -> i32 {
        self.field(mnt, self.offsets.mount_id)
    }

    pub fn mount_peer_group_id(&self, mnt: KernelPtr) -> i32 {
        self.field(mnt, self.offsets.mount_group_id)
    }

    /// `mount->mnt.mnt_sb->s_dev`
    pub fn mount_dev(&self, mnt: KernelPtr) -> u32 {
        let vfsmnt = self.mount_vfsmount(mnt);
        let sb: KernelPtr = self.field(vfsmnt, self.offsets.vfsmount_sb);
        self.field(sb, self.offsets.super_block_dev)
    }

    /// `mount->mnt.mnt_root`
    pub fn mount_root_dentry(&self, mnt: KernelPtr) -> KernelPtr {
        let vfsmnt = self.mount_vfsmount(mnt);
        self.field(vfsmnt, self.offsets.vfsmount_root)
    }

    pub fn mountpoint_dentry(&self, mp: KernelPtr) -> KernelPtr {
        self.field(mp, self.offsets.mountpoint_dentry)
    }

    pub fn dentry_parent(&self, dentry: KernelPtr) -> KernelPtr {
        self.field(dentry, self.offsets.dentry_parent)
    }

    /// `dentry->d_inode->i_ino`
    pub fn dentry_ino(&self, dentry: KernelPtr) -> u64 {
        let inode: KernelPtr = self.field(dentry, self.offsets.dentry_inode);
        self.field(inode, self.offsets.inode_ino)
    }

    /// Copy `dentry->d_name.name` into `dst`.
    pub fn dentry_name(&self, dentry: KernelPtr, dst: &mut [u8]) -> ReadOutcome {
        let name: KernelPtr = self.field(
            dentry,
            self.offsets.dentry_name.wrapping_add(self.offsets.qstr_name),
        );
        if name.is_null() {
            dst.fill(0);
            return ReadOutcome::Faulted;
        }
        self.mem.read_kernel_str(name, dst)
    }
}
