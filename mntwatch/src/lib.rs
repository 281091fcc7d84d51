pub mod dentry;
pub mod probes;
pub mod proc_cache;
pub mod record;
pub mod settings;
pub mod telemetry;

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{Array, HashMap, MapData},
};
use aya_log::EbpfLogger;
use log::{info, warn};
use mntwatch_common::{KernelOffsets, PathKey, PathLeaf, ProbeConfig, ProcCacheEntry};
use tokio::signal;

use crate::dentry::DentryResolver;
use crate::probes::{
    Probe,
    mount::{MountProbe, UmountProbe},
};
use crate::proc_cache::ProcCacheSeeder;
use crate::record::{BootClock, Event, RecordBuilder, decode, peek_header};
use crate::settings::{OutputFormat, Settings};

pub struct MntWatchEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl MntWatchEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        self.push_config()?;
        self.seed_proc_cache()?;
        self.spawn_event_handler()?;
        self.attach_probes()?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");
        probes::request_shutdown();

        Ok(())
    }

    /// Offsets and knobs must be in place before any program runs.
    fn push_config(&mut self) -> Result<()> {
        let offsets = self.settings.kernel_offsets();
        let mut offsets_map: Array<_, KernelOffsets> = self
            .bpf
            .map_mut("KERNEL_OFFSETS")
            .context("Failed to find KERNEL_OFFSETS map")?
            .try_into()
            .context("KERNEL_OFFSETS is not an Array")?;
        offsets_map.set(0, offsets, 0)?;
        info!("Kernel offsets: {:?}", offsets);

        let config: ProbeConfig = self.settings.probe_config();
        let mut config_map: Array<_, ProbeConfig> = self
            .bpf
            .map_mut("PROBE_CONFIG")
            .context("Failed to find PROBE_CONFIG map")?
            .try_into()
            .context("PROBE_CONFIG is not an Array")?;
        config_map.set(0, config, 0)?;
        info!(
            "Probe config: report_failed_mounts={}",
            config.report_failed_mounts()
        );

        Ok(())
    }

    fn seed_proc_cache(&mut self) -> Result<()> {
        let Some(every) = self.settings.proc_cache_refresh() else {
            info!("Process cache seeding disabled");
            return Ok(());
        };

        let map: HashMap<MapData, u32, ProcCacheEntry> = self
            .bpf
            .take_map("PROC_CACHE")
            .context("Failed to find PROC_CACHE map")?
            .try_into()?;
        let mut seeder = ProcCacheSeeder::new(map);
        match seeder.refresh() {
            Ok(n) => info!("Process cache seeded with {} containerized processes", n),
            Err(e) => warn!("Initial process cache scan failed: {:#}", e),
        }
        seeder.spawn(every);
        Ok(())
    }

    fn spawn_event_handler(&mut self) -> Result<()> {
        let pathnames: HashMap<MapData, PathKey, PathLeaf> = self
            .bpf
            .take_map("PATHNAMES")
            .context("Failed to find PATHNAMES map")?
            .try_into()?;
        let builder = RecordBuilder::new(
            DentryResolver::new(pathnames, self.settings.dentry_cache_size()),
            BootClock::now(),
        );
        let format = self.settings.output_format();

        probes::spawn_ringbuf_handler(&mut self.bpf, "EVENTS", move |bytes| {
            handle_record(&builder, format, bytes)
        })
    }

    fn attach_probes(&mut self) -> Result<()> {
        if self.settings.mount_enabled() {
            MountProbe.attach(&mut self.bpf)?;
        }

        if self.settings.umount_enabled() {
            UmountProbe.attach(&mut self.bpf)?;
        }

        Ok(())
    }
}

fn handle_record<S: dentry::PathSource>(
    builder: &RecordBuilder<S>,
    format: OutputFormat,
    bytes: &[u8],
) {
    let event = match decode(bytes) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping record: {} (header: {:?})", e, peek_header(bytes));
            return;
        }
    };

    match &event {
        Event::Mount(m) => {
            let container = Some(m.container_id()).filter(|id| !id.is_empty());
            telemetry::record_mount_event(m.fstype(), container, m.header.retval);
        }
        Event::Umount(u) => {
            let container = Some(u.container_id()).filter(|id| !id.is_empty());
            telemetry::record_umount_event(container);
        }
    }

    match builder.build(&event).render(format) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to render record: {:#}", e),
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
