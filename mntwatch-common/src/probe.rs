//! Probe entry points: correlate syscall entry, kernel-function probes and
//! syscall exit into one event.
//!
//! Each method maps to one attached program. Every path is infallible from
//! the traced process's point of view: missing correlation, unreadable memory
//! and a full channel all degrade to "no event".

use crate::cache::{CacheError, SyscallCache, SyscallCacheEntry};
use crate::dentry::DentryResolver;
use crate::event::{MountEvent, ProbeConfig, UmountEvent};
use crate::kernel::{KernelMemory, KernelPtr, KernelView};
use crate::mount::{MountAttach, MountState};
use crate::process::{ProcessContextProvider, TaskId};
use crate::sink::{Delivery, EventSink};
use crate::umount::UmountState;

/// What the exit probe knows about the returning syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallExit {
    pub task: TaskId,
    pub retval: i64,
    pub timestamp: u64,
    pub cpu: u32,
}

/// Outcome of a kernel-function probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intermediate {
    /// No monitored syscall is in flight on this thread.
    Uncorrelated,
    Recorded,
    /// Correlated, but the entry was of another kind or already filled.
    Ignored,
}

/// Outcome of a syscall exit probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Uncorrelated,
    Handled(Delivery),
}

pub struct MountProbes<'a, M, C, R, P> {
    view: KernelView<'a, M>,
    cache: &'a C,
    resolver: R,
    procs: &'a P,
    config: ProbeConfig,
}

impl<'a, M, C, R, P> MountProbes<'a, M, C, R, P>
where
    M: KernelMemory,
    C: SyscallCache,
    R: DentryResolver,
    P: ProcessContextProvider,
{
    pub fn new(
        view: KernelView<'a, M>,
        cache: &'a C,
        resolver: R,
        procs: &'a P,
        config: ProbeConfig,
    ) -> Self {
        Self {
            view,
            cache,
            resolver,
            procs,
            config,
        }
    }

    /// `mount(2)` entry. Only the filesystem type pointer is captured here.
    pub fn enter_mount(&self, tid: u32, fstype: u64) -> Result<(), CacheError> {
        self.cache
            .insert(tid, SyscallCacheEntry::Mount(MountState::new(fstype)))
    }

    /// `attach_recursive_mnt` / `propagate_mnt`.
    pub fn attach(&self, tid: u32, attach: MountAttach) -> Intermediate {
        self.cache
            .peek_with(tid, |entry| match entry {
                SyscallCacheEntry::Mount(state) => {
                    if state.attach(attach, self.view, &self.resolver) {
                        Intermediate::Recorded
                    } else {
                        Intermediate::Ignored
                    }
                }
                _ => Intermediate::Ignored,
            })
            .unwrap_or(Intermediate::Uncorrelated)
    }

    /// `mount(2)` exit.
    pub fn exit_mount<S: EventSink<MountEvent>>(&self, exit: &SyscallExit, sink: &S) -> Exit {
        let state = match self.cache.pop(exit.task.tid) {
            Some(SyscallCacheEntry::Mount(state)) => state,
            _ => return Exit::Uncorrelated,
        };

        Exit::Handled(sink.deliver(|event| {
            state.assemble(event, exit, self.view, &self.resolver, self.procs, &self.config)
        }))
    }

    /// `umount(2)` entry.
    pub fn enter_umount(&self, tid: u32) -> Result<(), CacheError> {
        self.cache
            .insert(tid, SyscallCacheEntry::Umount(UmountState::default()))
    }

    /// `security_sb_umount`.
    pub fn sb_umount(&self, tid: u32, vfsmnt: KernelPtr) -> Intermediate {
        self.cache
            .peek_with(tid, |entry| match entry {
                SyscallCacheEntry::Umount(state) => {
                    if state.record(vfsmnt) {
                        Intermediate::Recorded
                    } else {
                        Intermediate::Ignored
                    }
                }
                _ => Intermediate::Ignored,
            })
            .unwrap_or(Intermediate::Uncorrelated)
    }

    /// `umount(2)` exit.
    pub fn exit_umount<S: EventSink<UmountEvent>>(&self, exit: &SyscallExit, sink: &S) -> Exit {
        let state = match self.cache.pop(exit.task.tid) {
            Some(SyscallCacheEntry::Umount(state)) => state,
            _ => return Exit::Uncorrelated,
        };

        Exit::Handled(sink.deliver(|event| state.assemble(event, exit, self.view, self.procs)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::dentry::DentryWalker;
    use crate::event::PathKey;
    use crate::testing::{FakeKernel, FakeProcesses, MemoryPathStore, SlotCache, VecSink};

    type TestProbes<'a> = MountProbes<
        'a,
        FakeKernel,
        SlotCache<8>,
        DentryWalker<'a, FakeKernel, MemoryPathStore>,
        FakeProcesses,
    >;

    const ENOENT: i64 = -2;

    struct World {
        kernel: FakeKernel,
        /// Mount being attached: id 5, device 0x0801, root inode 2.
        src: KernelPtr,
        /// Mount hosting the mountpoint: id 1.
        dest: KernelPtr,
        /// `/mnt` on the destination mount, inode 42.
        mountpoint: KernelPtr,
        fstype: u64,
    }

    impl World {
        fn ext4() -> Self {
            let mut kernel = FakeKernel::new();
            let dest = kernel.add_mount(1, 0, 0x0803, 2);
            let dest_root = kernel.mount_root(dest);
            let mnt = kernel.add_dentry("mnt", 42, Some(dest_root));
            let mountpoint = kernel.add_mountpoint(mnt);
            let src = kernel.add_mount(5, 7, 0x0801, 2);
            let fstype = kernel.add_user_str(b"ext4\0");
            Self {
                kernel,
                src,
                dest,
                mountpoint,
                fstype,
            }
        }

        fn recursive(&self) -> MountAttach {
            MountAttach::recursive([self.src, self.dest, self.mountpoint])
        }

        fn propagated(&self) -> MountAttach {
            MountAttach::propagated([self.dest, self.mountpoint, self.src])
        }
    }

    struct Fixture {
        cache: SlotCache<8>,
        store: MemoryPathStore,
        procs: FakeProcesses,
        mounts: VecSink<MountEvent>,
        umounts: VecSink<UmountEvent>,
        config: ProbeConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cache: SlotCache::new(),
                store: MemoryPathStore::default(),
                procs: FakeProcesses::new(),
                mounts: VecSink::unbounded(),
                umounts: VecSink::unbounded(),
                config: ProbeConfig::DEFAULT,
            }
        }

        fn probes<'a>(&'a self, kernel: &'a FakeKernel) -> TestProbes<'a> {
            MountProbes::new(
                kernel.view(),
                &self.cache,
                DentryWalker::new(kernel.view(), &self.store),
                &self.procs,
                self.config,
            )
        }
    }

    fn task(tid: u32) -> TaskId {
        TaskId { pid: 100, tid }
    }

    fn exit(task: TaskId, retval: i64) -> SyscallExit {
        SyscallExit {
            task,
            retval,
            timestamp: 1_000_000,
            cpu: 1,
        }
    }

    #[test]
    fn mount_with_attach_emits_one_event() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        assert_eq!(probes.attach(200, world.recursive()), Intermediate::Recorded);
        let outcome = probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        assert_eq!(outcome, Exit::Handled(Delivery::Submitted));
        let events = fixture.mounts.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.fstype(), "ext4");
        assert_eq!(event.new_mount_id, 5);
        assert_eq!(event.new_group_id, 7);
        assert_eq!(event.new_device, 0x0801);
        assert_eq!(event.parent_mount_id, 1);
        assert_eq!(event.parent_ino, 42);
        assert_eq!(event.root_key(), PathKey::new(5, 2));
        assert_eq!(event.header.retval, 0);
        assert_eq!(event.header.event_type, crate::EventType::Mount as u32);
        assert_eq!(event.header.timestamp, 1_000_000);
        assert_eq!(event.process.pid, 100);
        assert_eq!(event.process.tid, 200);
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn mount_without_attach_emits_nothing() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        let outcome = probes.exit_mount(&exit(task(200), ENOENT), &fixture.mounts);

        assert_eq!(outcome, Exit::Handled(Delivery::Filtered));
        assert!(fixture.mounts.events().is_empty());
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn alternate_attach_paths_produce_identical_events() {
        let world = World::ext4();

        let run = |attach: MountAttach| {
            let fixture = Fixture::new();
            let probes = fixture.probes(&world.kernel);
            probes.enter_mount(200, world.fstype).unwrap();
            probes.attach(200, attach);
            probes.exit_mount(&exit(task(200), 0), &fixture.mounts);
            let events = fixture.mounts.events();
            assert_eq!(events.len(), 1);
            (events[0], fixture.store.snapshot())
        };

        let (recursive, recursive_paths) = run(world.recursive());
        let (propagated, propagated_paths) = run(world.propagated());

        assert_eq!(bytemuck::bytes_of(&recursive), bytemuck::bytes_of(&propagated));
        assert_eq!(recursive_paths, propagated_paths);
    }

    #[test]
    fn later_alternate_path_does_not_overwrite_first_attach() {
        let mut world = World::ext4();
        let other = world.kernel.add_mount(9, 0, 0x0900, 3);
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        assert_eq!(probes.attach(200, world.recursive()), Intermediate::Recorded);
        let late = MountAttach::propagated([world.dest, world.mountpoint, other]);
        assert_eq!(probes.attach(200, late), Intermediate::Ignored);
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        let events = fixture.mounts.events();
        assert_eq!(events[0].new_mount_id, 5);
        assert_eq!(events[0].root_key(), PathKey::new(5, 2));
    }

    #[test]
    fn kernel_probe_without_syscall_in_flight_is_ignored() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        assert_eq!(probes.attach(200, world.recursive()), Intermediate::Uncorrelated);
        assert_eq!(probes.sb_umount(200, KernelPtr(0x1000)), Intermediate::Uncorrelated);
        assert!(fixture.cache.is_empty());
        assert_eq!(fixture.store.len(), 0);
    }

    #[test]
    fn repeated_exit_delivers_at_most_once() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        assert_eq!(
            probes.exit_mount(&exit(task(200), 0), &fixture.mounts),
            Exit::Handled(Delivery::Submitted)
        );
        assert_eq!(probes.exit_mount(&exit(task(200), 0), &fixture.mounts), Exit::Uncorrelated);
        assert_eq!(fixture.mounts.events().len(), 1);
    }

    #[test]
    fn concurrent_threads_get_independent_events() {
        let mut world = World::ext4();
        let dest_root = world.kernel.mount_root(world.dest);
        let data = world.kernel.add_dentry("data", 77, Some(dest_root));
        let second_mountpoint = world.kernel.add_mountpoint(data);
        let second_src = world.kernel.add_mount(6, 0, 0x0802, 2);
        let tmpfs = world.kernel.add_user_str(b"tmpfs\0");

        let fixture = Fixture::new();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            let jobs = [
                (
                    300u32,
                    world.fstype,
                    MountAttach::recursive([world.src, world.dest, world.mountpoint]),
                ),
                (
                    301u32,
                    tmpfs,
                    MountAttach::propagated([world.dest, second_mountpoint, second_src]),
                ),
            ];
            for (tid, fstype, attach) in jobs {
                let (world, fixture, barrier) = (&world, &fixture, &barrier);
                s.spawn(move || {
                    let probes = fixture.probes(&world.kernel);
                    probes.enter_mount(tid, fstype).unwrap();
                    barrier.wait();
                    assert_eq!(probes.attach(tid, attach), Intermediate::Recorded);
                    barrier.wait();
                    probes.exit_mount(&exit(task(tid), 0), &fixture.mounts);
                });
            }
        });

        let mut events = fixture.mounts.events();
        events.sort_by_key(|e| e.process.tid);
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].process.tid, 300);
        assert_eq!(events[0].fstype(), "ext4");
        assert_eq!(events[0].new_mount_id, 5);
        assert_eq!(events[0].new_device, 0x0801);
        assert_eq!(events[0].parent_ino, 42);

        assert_eq!(events[1].process.tid, 301);
        assert_eq!(events[1].fstype(), "tmpfs");
        assert_eq!(events[1].new_mount_id, 6);
        assert_eq!(events[1].new_device, 0x0802);
        assert_eq!(events[1].parent_ino, 77);
    }

    #[test]
    fn full_cache_loses_correlation_without_failing() {
        let world = World::ext4();
        let cache = SlotCache::<1>::new();
        let store = MemoryPathStore::default();
        let procs = FakeProcesses::new();
        let sink = VecSink::unbounded();
        let probes = MountProbes::new(
            world.kernel.view(),
            &cache,
            DentryWalker::new(world.kernel.view(), &store),
            &procs,
            ProbeConfig::DEFAULT,
        );

        probes.enter_mount(1, world.fstype).unwrap();
        assert_eq!(probes.enter_mount(2, world.fstype), Err(CacheError::Full));
        assert_eq!(probes.attach(2, world.recursive()), Intermediate::Uncorrelated);
        assert_eq!(probes.exit_mount(&exit(task(2), 0), &sink), Exit::Uncorrelated);

        probes.attach(1, world.recursive());
        assert_eq!(probes.exit_mount(&exit(task(1), 0), &sink), Exit::Handled(Delivery::Submitted));
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn cached_container_context_is_copied() {
        let world = World::ext4();
        let mut fixture = Fixture::new();
        fixture.procs = FakeProcesses::new().with_container(100, "4f2a9c1d7e3b", 3);
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        let event = fixture.mounts.events()[0];
        assert_eq!(event.container_id(), "4f2a9c1d7e3b");
        assert_eq!(event.process.numlower, 3);
    }

    #[test]
    fn missing_process_cache_degrades_enrichment_only() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        let event = fixture.mounts.events()[0];
        assert_eq!(event.container_id(), "");
        assert_eq!(event.process.numlower, 0);
        assert_eq!(event.process.comm(), "mount");
    }

    #[test]
    fn unreadable_fstype_still_delivers() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, 0x4141_0000).unwrap();
        probes.attach(200, world.recursive());
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        let event = fixture.mounts.events()[0];
        assert_eq!(event.fstype(), "");
        assert_eq!(event.new_mount_id, 5);
    }

    #[test]
    fn long_fstype_is_truncated_and_terminated() {
        let mut world = World::ext4();
        let fstype = world.kernel.add_user_str(b"fuse.sshfs-with-a-long-name\0");
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, fstype).unwrap();
        probes.attach(200, world.recursive());
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        let event = fixture.mounts.events()[0];
        assert_eq!(event.fstype(), "fuse.sshfs-with");
        assert_eq!(event.fstype[crate::FSTYPE_LEN - 1], 0);
    }

    #[test]
    fn failed_mount_with_identifiers_follows_config() {
        let world = World::ext4();

        let mut fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);
        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        probes.exit_mount(&exit(task(200), ENOENT), &fixture.mounts);
        assert_eq!(fixture.mounts.events()[0].header.retval, ENOENT);

        fixture = Fixture::new();
        fixture.config = ProbeConfig::new(false);
        let probes = fixture.probes(&world.kernel);
        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        assert_eq!(
            probes.exit_mount(&exit(task(200), ENOENT), &fixture.mounts),
            Exit::Handled(Delivery::Filtered)
        );
        assert!(fixture.mounts.events().is_empty());
    }

    #[test]
    fn root_and_parent_ancestries_are_both_registered() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        let root = fixture.store.get(&PathKey::new(5, 2)).unwrap();
        assert_eq!(root.name(), "/");
        let parent = fixture.store.get(&PathKey::new(1, 42)).unwrap();
        assert_eq!(parent.name(), "mnt");
        assert_eq!(parent.parent, PathKey::new(1, 2));
    }

    #[test]
    fn filtered_mount_skips_parent_registration() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        probes.exit_mount(&exit(task(200), 0), &fixture.mounts);

        assert_eq!(fixture.store.len(), 0);
    }

    #[test]
    fn backpressure_drops_event_but_consumes_entry() {
        let world = World::ext4();
        let mut fixture = Fixture::new();
        fixture.mounts = VecSink::with_capacity(0);
        let probes = fixture.probes(&world.kernel);

        probes.enter_mount(200, world.fstype).unwrap();
        probes.attach(200, world.recursive());
        assert_eq!(
            probes.exit_mount(&exit(task(200), 0), &fixture.mounts),
            Exit::Handled(Delivery::Dropped)
        );
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn umount_is_correlated_through_security_hook() {
        let world = World::ext4();
        let vfsmnt = world.kernel.view().mount_vfsmount(world.src);
        let mut fixture = Fixture::new();
        fixture.procs = FakeProcesses::new().with_container(100, "abc", 1);
        let probes = fixture.probes(&world.kernel);

        probes.enter_umount(200).unwrap();
        assert_eq!(probes.sb_umount(200, vfsmnt), Intermediate::Recorded);
        let outcome = probes.exit_umount(&exit(task(200), 0), &fixture.umounts);

        assert_eq!(outcome, Exit::Handled(Delivery::Submitted));
        let event = fixture.umounts.events()[0];
        assert_eq!(event.mount_id, 5);
        assert_eq!(event.header.event_type, crate::EventType::Umount as u32);
        assert_eq!(event.container_id(), "abc");
        assert_eq!(event.process.numlower, 1);
    }

    #[test]
    fn umount_without_security_hook_emits_nothing() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_umount(200).unwrap();
        assert_eq!(
            probes.exit_umount(&exit(task(200), -22), &fixture.umounts),
            Exit::Handled(Delivery::Filtered)
        );
        assert!(fixture.umounts.events().is_empty());
    }

    #[test]
    fn probes_for_another_syscall_kind_leave_entry_untouched() {
        let world = World::ext4();
        let fixture = Fixture::new();
        let probes = fixture.probes(&world.kernel);

        probes.enter_umount(200).unwrap();
        assert_eq!(probes.attach(200, world.recursive()), Intermediate::Ignored);
        assert_eq!(
            fixture.cache.pop(200),
            Some(SyscallCacheEntry::Umount(UmountState::default()))
        );
    }
}
