use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::RingBuf,
    programs::{KProbe, TracePoint},
};
use log::{debug, info, warn};

pub mod mount;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Sleep between ring buffer polls when nothing was pending.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// One BPF program and the kernel hook it runs on.
#[derive(Debug, Clone, Copy)]
pub enum Hook {
    /// Entry of a kernel function. Required: attaching fails if the symbol
    /// is missing.
    KProbe {
        program: &'static str,
        function: &'static str,
    },
    /// Static tracepoint. Skipped with a warning when tracefs does not list it.
    Tracepoint {
        program: &'static str,
        category: &'static str,
        name: &'static str,
    },
}

impl Hook {
    pub const fn syscall(program: &'static str, name: &'static str) -> Self {
        Hook::Tracepoint {
            program,
            category: "syscalls",
            name,
        }
    }

    pub fn program(&self) -> &'static str {
        match *self {
            Hook::KProbe { program, .. } | Hook::Tracepoint { program, .. } => program,
        }
    }

    /// Load and attach. Returns `false` for an unavailable tracepoint.
    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        let program_name = self.program();
        let program = bpf
            .program_mut(program_name)
            .with_context(|| format!("No program named {} in the eBPF object", program_name))?;

        match *self {
            Hook::KProbe { function, .. } => {
                let kprobe: &mut KProbe = program.try_into()?;
                kprobe.load()?;
                kprobe
                    .attach(function, 0)
                    .with_context(|| format!("Failed to attach kprobe to {}", function))?;
            }
            Hook::Tracepoint { category, name, .. } => {
                if !tracepoint_available(category, name) {
                    warn!(
                        "Tracepoint {}:{} not available; skipping {}",
                        category, name, program_name
                    );
                    return Ok(false);
                }
                let tracepoint: &mut TracePoint = program.try_into()?;
                tracepoint.load()?;
                tracepoint
                    .attach(category, name)
                    .with_context(|| format!("Failed to attach tracepoint {}:{}", category, name))?;
            }
        }

        debug!("Attached {}", program_name);
        Ok(true)
    }
}

fn tracepoint_available(category: &str, name: &str) -> bool {
    TRACEFS_ROOTS
        .iter()
        .map(|root| Path::new(root).join("events").join(category).join(name))
        .any(|dir| dir.exists())
}

/// Attach `hooks` in order. Returns how many programs are live.
pub fn attach_hooks(bpf: &mut Ebpf, hooks: &[Hook]) -> Result<u64> {
    let mut attached = 0;
    for hook in hooks {
        if hook.attach(bpf)? {
            attached += 1;
        }
    }
    Ok(attached)
}

pub trait Probe {
    /// Attach every program of the probe. Returns the number of live programs.
    fn attach(&self, bpf: &mut Ebpf) -> Result<u64>;
}

/// Hand every pending record to `handler`; returns how many there were.
fn drain<F: FnMut(&[u8])>(ring_buf: &mut RingBuf<aya::maps::MapData>, handler: &mut F) -> usize {
    let mut drained = 0;
    while let Some(item) = ring_buf.next() {
        handler(&item);
        drained += 1;
    }
    drained
}

/// Poll a ring buffer on a blocking task until shutdown.
pub fn spawn_ringbuf_handler<F>(bpf: &mut Ebpf, map_name: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    let map = bpf
        .take_map(map_name)
        .with_context(|| format!("Failed to find {} map", map_name))?;
    let mut ring_buf = RingBuf::try_from(map)?;
    info!("Draining {} ring buffer", map_name);

    tokio::task::spawn_blocking(move || {
        while !shutdown_requested() {
            if drain(&mut ring_buf, &mut handler) == 0 {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    });
    Ok(())
}
