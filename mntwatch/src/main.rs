use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use mntwatch::{MntWatchEngine, settings::OutputFormat, settings::Settings, telemetry};

/// Trace mount and umount operations system-wide.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Opt {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format of mount records (overrides OUTPUT__FORMAT)
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// YAML settings file; environment variables take precedence
    #[arg(short, long, env = "MNTWATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    if let Some(format) = opt.format {
        settings.output.format = Some(format);
    }

    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;

    let engine = MntWatchEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/mntwatch")),
    )?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
