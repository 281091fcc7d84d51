//! In-memory stand-ins for the kernel-side collaborators.

use std::collections::HashMap;
use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};

use crate::cache::{CacheError, SyscallCache, SyscallCacheEntry};
use crate::dentry::{DentryResolver, PathStore};
use crate::event::{PathKey, PathLeaf, ProcCacheEntry, ProcessContext};
use crate::kernel::{KernelMemory, KernelOffsets, KernelPtr, KernelView, ReadOutcome};
use crate::process::{ProcessContextProvider, TaskId};
use crate::sink::{Delivery, EventSink};

const BLOCK: u64 = 0x1000;
const KERNEL_BASE: u64 = 0xffff_8880_0000_0000;
const USER_BASE: u64 = 0x7ffd_0000_0000;

type Region = (u64, Vec<u8>);

/// Sparse address space holding fake `mount`, `dentry`, `inode` and
/// `super_block` objects laid out with [`KernelOffsets::DEFAULT`].
pub struct FakeKernel {
    offsets: KernelOffsets,
    kernel: Vec<Region>,
    user: Vec<Region>,
    next_kernel: u64,
    next_user: u64,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            offsets: KernelOffsets::DEFAULT,
            kernel: Vec::new(),
            user: Vec::new(),
            next_kernel: KERNEL_BASE,
            next_user: USER_BASE,
        }
    }

    pub fn view(&self) -> KernelView<'_, FakeKernel> {
        KernelView::new(self, &self.offsets)
    }

    fn alloc(&mut self) -> KernelPtr {
        let addr = self.next_kernel;
        self.next_kernel += BLOCK;
        self.kernel.push((addr, vec![0; BLOCK as usize]));
        KernelPtr(addr)
    }

    fn write_bytes(&mut self, addr: KernelPtr, bytes: &[u8]) {
        let (base, buf) = self
            .kernel
            .iter_mut()
            .find(|(base, buf)| addr.0 >= *base && addr.0 < *base + buf.len() as u64)
            .expect("write to unmapped fake kernel address");
        let start = (addr.0 - *base) as usize;
        buf[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn write<T: Pod>(&mut self, addr: KernelPtr, value: T) {
        self.write_bytes(addr, bytemuck::bytes_of(&value));
    }

    /// Allocate a dentry with its inode. A dentry without parent is its own
    /// parent, like a filesystem root.
    pub fn add_dentry(&mut self, name: &str, ino: u64, parent: Option<KernelPtr>) -> KernelPtr {
        let o = self.offsets;
        let dentry = self.alloc();
        let inode = self.alloc();
        let name_buf = self.alloc();

        let mut raw = name.as_bytes().to_vec();
        raw.push(0);
        self.write_bytes(name_buf, &raw);

        self.write(inode.add(o.inode_ino), ino);
        self.write(dentry.add(o.dentry_inode), inode);
        self.write(dentry.add(o.dentry_parent), parent.unwrap_or(dentry));
        self.write(dentry.add(o.dentry_name + o.qstr_len), name.len() as u32);
        self.write(dentry.add(o.dentry_name + o.qstr_name), name_buf);
        dentry
    }

    /// Allocate a `struct mount` with a super block and a `/` root dentry.
    pub fn add_mount(
        &mut self,
        mount_id: i32,
        group_id: i32,
        dev: u32,
        root_ino: u64,
    ) -> KernelPtr {
        let o = self.offsets;
        let mnt = self.alloc();
        let sb = self.alloc();
        let root = self.add_dentry("/", root_ino, None);
        let vfsmnt = mnt.add(o.mount_mnt);

        self.write(mnt.add(o.mount_id), mount_id);
        self.write(mnt.add(o.mount_group_id), group_id);
        self.write(vfsmnt.add(o.vfsmount_root), root);
        self.write(vfsmnt.add(o.vfsmount_sb), sb);
        self.write(sb.add(o.super_block_dev), dev);
        mnt
    }

    pub fn mount_root(&self, mnt: KernelPtr) -> KernelPtr {
        self.view().mount_root_dentry(mnt)
    }

    /// Allocate a `struct mountpoint` pointing at `dentry`.
    pub fn add_mountpoint(&mut self, dentry: KernelPtr) -> KernelPtr {
        let mp = self.alloc();
        self.write(mp.add(self.offsets.mountpoint_dentry), dentry);
        mp
    }

    /// Place raw bytes in the traced process's address space.
    pub fn add_user_str(&mut self, bytes: &[u8]) -> u64 {
        let addr = self.next_user;
        self.next_user += BLOCK;
        self.user.push((addr, bytes.to_vec()));
        addr
    }

    fn slice(regions: &[Region], addr: u64, len: usize) -> Option<&[u8]> {
        regions.iter().find_map(|(base, buf)| {
            let end = *base + buf.len() as u64;
            if addr >= *base && addr.checked_add(len as u64)? <= end {
                let start = (addr - base) as usize;
                Some(&buf[start..start + len])
            } else {
                None
            }
        })
    }

    /// `bpf_probe_read_*_str` semantics.
    fn read_str(regions: &[Region], addr: u64, dst: &mut [u8]) -> ReadOutcome {
        let src = regions.iter().find_map(|(base, buf)| {
            (addr >= *base && addr < *base + buf.len() as u64)
                .then(|| &buf[(addr - base) as usize..])
        });
        let Some(src) = src else {
            dst.fill(0);
            return ReadOutcome::Faulted;
        };
        if dst.is_empty() {
            return ReadOutcome::Truncated(0);
        }

        // A terminator landing on the last byte still counts as truncated.
        let limit = dst.len() - 1;
        match src.iter().take(limit).position(|&b| b == 0) {
            Some(n) => {
                dst[..n].copy_from_slice(&src[..n]);
                dst[n] = 0;
                ReadOutcome::Complete(n + 1)
            }
            None => {
                let n = limit.min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
                dst[n] = 0;
                ReadOutcome::Truncated(n + 1)
            }
        }
    }
}

impl KernelMemory for FakeKernel {
    fn read<T: Pod>(&self, addr: KernelPtr) -> Option<T> {
        Self::slice(&self.kernel, addr.0, size_of::<T>()).map(bytemuck::pod_read_unaligned)
    }

    fn read_user_str(&self, addr: u64, dst: &mut [u8]) -> ReadOutcome {
        Self::read_str(&self.user, addr, dst)
    }

    fn read_kernel_str(&self, addr: KernelPtr, dst: &mut [u8]) -> ReadOutcome {
        Self::read_str(&self.kernel, addr.0, dst)
    }
}

/// Fixed-capacity correlation table.
pub struct SlotCache<const N: usize> {
    slots: Mutex<[Option<(u32, SyscallCacheEntry)>; N]>,
}

impl<const N: usize> SlotCache<N> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([None; N]),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const N: usize> SyscallCache for SlotCache<N> {
    fn insert(&self, tid: u32, entry: SyscallCacheEntry) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = match slots.iter().position(|s| matches!(s, Some((t, _)) if *t == tid)) {
            Some(i) => i,
            None => slots.iter().position(Option::is_none).ok_or(CacheError::Full)?,
        };
        slots[slot] = Some((tid, entry));
        Ok(())
    }

    fn peek_with<R, F>(&self, tid: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut SyscallCacheEntry) -> R,
    {
        let mut slots = self.slots.lock().unwrap();
        slots
            .iter_mut()
            .find_map(|s| match s {
                Some((t, entry)) if *t == tid => Some(entry),
                _ => None,
            })
            .map(f)
    }

    fn pop(&self, tid: u32) -> Option<SyscallCacheEntry> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .iter_mut()
            .find(|s| matches!(s, Some((t, _)) if *t == tid))
            .and_then(Option::take)
            .map(|(_, entry)| entry)
    }
}

#[derive(Default)]
pub struct MemoryPathStore {
    leaves: Mutex<HashMap<PathKey, PathLeaf>>,
}

impl MemoryPathStore {
    pub fn get(&self, key: &PathKey) -> Option<PathLeaf> {
        self.leaves.lock().unwrap().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.leaves.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> HashMap<PathKey, PathLeaf> {
        self.leaves.lock().unwrap().clone()
    }
}

impl PathStore for MemoryPathStore {
    fn store(&self, key: &PathKey, leaf: &PathLeaf) -> bool {
        self.leaves.lock().unwrap().insert(*key, *leaf);
        true
    }
}

/// Records registrations without walking anything.
#[derive(Default)]
pub struct RecordingResolver {
    calls: Mutex<Vec<(KernelPtr, PathKey, Option<PathKey>)>>,
}

impl RecordingResolver {
    pub fn keys(&self) -> Vec<PathKey> {
        self.calls.lock().unwrap().iter().map(|(_, key, _)| *key).collect()
    }
}

impl DentryResolver for RecordingResolver {
    fn register_dentry(&self, dentry: KernelPtr, key: PathKey, parent_hint: Option<PathKey>) {
        self.calls.lock().unwrap().push((dentry, key, parent_hint));
    }
}

pub struct FakeProcesses {
    containers: HashMap<u32, ProcCacheEntry>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self {
            containers: HashMap::new(),
        }
    }

    pub fn with_container(mut self, pid: u32, container_id: &str, numlower: u32) -> Self {
        self.containers.insert(pid, ProcCacheEntry::new(container_id, numlower));
        self
    }
}

impl ProcessContextProvider for FakeProcesses {
    fn fill_process_data(&self, task: TaskId) -> ProcessContext {
        let mut process = ProcessContext::zeroed();
        process.pid = task.pid;
        process.tid = task.tid;
        process.uid = 1000;
        process.gid = 1000;
        process.cgroup_id = 0x2a;
        process.comm[..5].copy_from_slice(b"mount");
        process
    }

    fn lookup_process_cache(&self, pid: u32) -> Option<ProcCacheEntry> {
        self.containers.get(&pid).copied()
    }
}

/// Collects delivered records; refuses to reserve once `capacity` is reached.
pub struct VecSink<E> {
    events: Mutex<Vec<E>>,
    capacity: usize,
}

impl<E: Pod> VecSink<E> {
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }
}

impl<E: Pod> EventSink<E> for VecSink<E> {
    fn deliver<F>(&self, fill: F) -> Delivery
    where
        F: FnOnce(&mut E) -> bool,
    {
        if self.events.lock().unwrap().len() >= self.capacity {
            return Delivery::Dropped;
        }
        let mut event = E::zeroed();
        if !fill(&mut event) {
            return Delivery::Filtered;
        }
        self.events.lock().unwrap().push(event);
        Delivery::Submitted
    }
}
