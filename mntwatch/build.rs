use std::{env, path::PathBuf, process::Command};

use anyhow::{Context, Result, bail};

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    println!("cargo:rerun-if-changed=../mntwatch-ebpf/src");
    println!("cargo:rerun-if-changed=../mntwatch-common/src");

    let arch = env::var("CARGO_CFG_TARGET_ARCH")?;
    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{arch}', defaulting to bpfel-unknown-none"
            );
            "bpfel-unknown-none"
        }
    };

    let ebpf_dir = PathBuf::from("../mntwatch-ebpf");
    // Separate target directory so the nested build does not wait on our lock.
    let ebpf_target_dir = out_dir.join("ebpf-target");
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(&ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={bpf_target}"),
            "-Z",
            "build-std=core",
        ])
        .status()
        .context("Failed to execute cargo for the eBPF build")?;

    if !status.success() {
        bail!("Failed to build eBPF program ({status})");
    }

    let ebpf_binary = ebpf_target_dir.join(format!("{bpf_target}/release/mntwatch"));
    std::fs::copy(&ebpf_binary, out_dir.join("mntwatch"))
        .with_context(|| format!("Failed to copy {}", ebpf_binary.display()))?;

    Ok(())
}
