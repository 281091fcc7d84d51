use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "mntwatch";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and deploy mntwatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the tracer (eBPF object is embedded by the mntwatch build script)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Copy the binary to a remote host
    Deploy {
        /// Remote host (user@host or host)
        #[arg(long)]
        host: String,

        /// Remote install path
        #[arg(long, default_value = "/usr/local/bin/mntwatch")]
        path: String,

        /// Target triple for cross-compilation
        #[arg(long)]
        target: Option<String>,

        /// Restart the systemd unit afterwards
        #[arg(long)]
        restart: bool,
    },

    /// Install the systemd unit on a remote host
    InstallService {
        /// Remote host
        #[arg(long)]
        host: String,

        /// YAML settings file on the remote host, passed as MNTWATCH_CONFIG
        #[arg(long)]
        config: Option<String>,
    },

    /// Produce a release tarball with install scripts
    Package {
        /// Target triple
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Deploy {
            host,
            path,
            target,
            restart,
        } => {
            deploy(&host, &path, target.as_deref(), restart)?;
        }
        Commands::InstallService { host, config } => {
            install_service(&host, config.as_deref())?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut dir = root.join("target");
    if let Some(t) = target {
        dir = dir.join(t);
    }
    dir.join(profile).join(BINARY)
}

fn run(cmd: &mut Command, what: &str) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("Failed to spawn {}", what))?;
    if !status.success() {
        bail!("{} failed: {}", what, status);
    }
    Ok(())
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("Building {}...", BINARY);

    // The tracer only runs on Linux; anything else needs a container toolchain.
    let cross = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let program = if cross {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross'.\n\
                 Install with: cargo install cross (Docker must be running)"
            );
        }
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(program);
    cmd.current_dir(&root).arg("build").arg("-p").arg(BINARY);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        println!("   Target: {}", t);
        cmd.arg("--target").arg(t);
    }
    run(&mut cmd, "cargo build")?;

    let binary = binary_path(&root, release, target);
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }
    println!("Build complete: {}", binary.display());
    Ok(binary)
}

fn deploy(host: &str, remote_path: &str, target: Option<&str>, restart: bool) -> Result<()> {
    let binary = build(true, target)?;
    let staging = format!("/tmp/{}.tmp", BINARY);

    println!("Deploying to {}:{}", host, remote_path);
    run(
        Command::new("scp")
            .arg(&binary)
            .arg(format!("{}:{}", host, staging)),
        "scp",
    )?;
    run(
        Command::new("ssh").arg(host).arg(format!(
            "sudo install -m 755 {} {} && rm -f {}",
            staging, remote_path, staging
        )),
        "remote install",
    )?;

    if restart {
        println!("Restarting {} service...", BINARY);
        let status = Command::new("ssh")
            .arg(host)
            .arg(format!("sudo systemctl restart {}", BINARY))
            .status()
            .context("Failed to run ssh")?;
        if !status.success() {
            println!("Service restart failed (is the unit installed?)");
        }
    }

    Ok(())
}

fn install_service(host: &str, config: Option<&str>) -> Result<()> {
    let unit = systemd_unit(config);
    let escaped = unit.replace('\'', "'\\''");

    println!("Installing systemd unit on {}...", host);
    run(
        Command::new("ssh").arg(host).arg(format!(
            "echo '{escaped}' | sudo tee /etc/systemd/system/{BINARY}.service > /dev/null && \
             sudo systemctl daemon-reload && \
             sudo systemctl enable {BINARY}"
        )),
        "remote unit install",
    )?;

    println!("Unit installed. Start with: ssh {} sudo systemctl start {}", host, BINARY);
    Ok(())
}

/// Loading kprobes and tracepoints needs CAP_BPF and CAP_PERFMON; reading
/// every task's cgroup and mountinfo needs CAP_SYS_PTRACE and
/// CAP_DAC_READ_SEARCH. CAP_SYS_ADMIN covers kernels that predate CAP_BPF.
fn systemd_unit(config: Option<&str>) -> String {
    let env_line = config
        .map(|c| format!("Environment=MNTWATCH_CONFIG={}", c))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description=mntwatch mount/umount tracer
After=local-fs.target

[Service]
Type=simple
ExecStart=/usr/local/bin/{BINARY} --format json
Restart=on-failure
RestartSec=5
{env_line}
EnvironmentFile=-/etc/{BINARY}/{BINARY}.env

CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON \
    CAP_SYS_PTRACE CAP_DAC_READ_SEARCH CAP_SYS_RESOURCE
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON \
    CAP_SYS_PTRACE CAP_DAC_READ_SEARCH CAP_SYS_RESOURCE

[Install]
WantedBy=multi-user.target
"#
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    let root = project_root()?;

    let output = root.join(output_dir);
    let arch = target.unwrap_or(env::consts::ARCH);
    let name = format!("{}-{}-{}", BINARY, env!("CARGO_PKG_VERSION"), arch);
    let staging = output.join(&name);
    fs::create_dir_all(&staging).context("Failed to create package directory")?;

    fs::copy(&binary, staging.join(BINARY))?;
    for (src, dst) in [
        ("example.env", format!("{}.env.example", BINARY)),
        ("mntwatch.example.yaml", format!("{}.yaml.example", BINARY)),
    ] {
        let path = root.join(src);
        if path.exists() {
            fs::copy(&path, staging.join(dst))?;
        }
    }

    fs::write(staging.join("install.sh"), install_script())?;
    fs::write(
        staging.join("install-service.sh"),
        format!(
            r#"#!/bin/bash
set -e

cat > /tmp/{BINARY}.service << 'EOF'
{}EOF

sudo mv /tmp/{BINARY}.service /etc/systemd/system/{BINARY}.service
sudo systemctl daemon-reload
sudo systemctl enable {BINARY}

echo "Unit installed. Start with: sudo systemctl start {BINARY}"
"#,
            systemd_unit(Some(&format!("/etc/{}/{}.yaml", BINARY, BINARY)))
        ),
    )?;

    let tarball = output.join(format!("{}.tar.gz", name));
    run(
        Command::new("tar")
            .current_dir(&output)
            .arg("-czf")
            .arg(&tarball)
            .arg(&name),
        "tar",
    )?;
    fs::remove_dir_all(&staging)?;

    println!("Package created: {}", tarball.display());
    Ok(())
}

fn install_script() -> String {
    format!(
        r#"#!/bin/bash
set -e

INSTALL_DIR="${{INSTALL_DIR:-/usr/local/bin}}"
CONFIG_DIR="${{CONFIG_DIR:-/etc/{BINARY}}}"

sudo install -m 755 {BINARY} "$INSTALL_DIR/{BINARY}"
sudo mkdir -p "$CONFIG_DIR"
for f in {BINARY}.env {BINARY}.yaml; do
    if [ -f "$f.example" ] && [ ! -f "$CONFIG_DIR/$f" ]; then
        sudo cp "$f.example" "$CONFIG_DIR/$f"
    fi
done

echo "Installed to $INSTALL_DIR/{BINARY}"
echo "Run ./install-service.sh to register the systemd unit."
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_points_at_config_file() {
        let unit = systemd_unit(Some("/etc/mntwatch/mntwatch.yaml"));
        assert!(unit.contains("Environment=MNTWATCH_CONFIG=/etc/mntwatch/mntwatch.yaml"));
        assert!(unit.contains("ExecStart=/usr/local/bin/mntwatch"));
    }

    #[test]
    fn unit_without_config_has_no_environment_line() {
        assert!(!systemd_unit(None).contains("MNTWATCH_CONFIG"));
    }

    #[test]
    fn binary_path_respects_target() {
        let root = Path::new("/src");
        assert_eq!(
            binary_path(root, true, Some("aarch64-unknown-linux-gnu")),
            Path::new("/src/target/aarch64-unknown-linux-gnu/release/mntwatch")
        );
        assert_eq!(
            binary_path(root, false, None),
            Path::new("/src/target/debug/mntwatch")
        );
    }
}
