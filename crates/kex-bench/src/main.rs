//! kex-bench
//!
//! Measures handshake latency of an external timing program while a
//! client/server namespace pair is shaped through latency tiers and loss
//! rates.
//!
//! - `setup` creates the namespace pair and installs the netem qdiscs
//! - `run` sweeps latencies × configurations × loss rates into CSV tables
//! - `probe` prints the RTT label the current shaping would produce
//! - `teardown` removes the namespace pair

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use kex_bench::{ExperimentOrchestrator, RunConfigInput};
use kex_netem::{topology, LatencyProbe, ProcessRunner, ShapingProfile};
use tracing_subscriber::EnvFilter;

/// Handshake latency under emulated network conditions.
#[derive(Parser, Debug)]
#[command(name = "kex-bench", about = "Handshake latency under emulated WAN conditions")]
struct Cli {
    /// Run configuration (TOML). Without it the reference experiment runs.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run `ip`/`tc`/timer commands without `sudo`.
    #[arg(long, global = true, default_value_t = false)]
    no_sudo: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the client/server namespace pair and install netem.
    Setup,
    /// Delete the namespace pair.
    Teardown,
    /// Measure the RTT from the client scope and print its label.
    Probe,
    /// Run the full experiment.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory for the CSV tables and run manifest.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Number of concurrent timer workers.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Timer invocations per configuration and loss rate.
    #[arg(long)]
    timers: Option<usize>,

    /// Handshakes measured per timer invocation.
    #[arg(long)]
    measurements: Option<usize>,

    /// Continue an earlier run in the output directory: tiers keep their
    /// recorded RTT label and finished tables are skipped.
    #[arg(long, default_value_t = false)]
    resume: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut input = match &cli.config {
        Some(path) => RunConfigInput::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RunConfigInput::default(),
    };
    if cli.no_sudo {
        input.sudo = Some(false);
    }
    if let Command::Run(args) = &cli.command {
        input.output_dir = args.output_dir.clone().or(input.output_dir);
        input.pool_size = args.pool_size.or(input.pool_size);
        input.timers = args.timers.or(input.timers);
        input.measurements_per_timer = args.measurements.or(input.measurements_per_timer);
    }
    let config = input.resolve().context("invalid run configuration")?;
    let runner = Arc::new(ProcessRunner::new());

    match cli.command {
        Command::Setup => {
            let delay = config
                .latencies
                .first()
                .context("no latency configured")?;
            let initial = ShapingProfile::with_limits(0.0, delay, config.shaping.clone());
            topology::setup_pair(runner.as_ref(), &config.client, &config.server, &initial)
                .context("namespace setup failed")?;
        }
        Command::Teardown => {
            topology::teardown_pair(runner.as_ref(), &config.client, &config.server);
            tracing::info!("namespace pair removed");
        }
        Command::Probe => {
            let probe = LatencyProbe::new(runner, &config.probe.peer, config.probe.count);
            let label = probe
                .measure_rtt_label(&config.client)
                .context("RTT probe failed")?;
            println!("{label}");
        }
        Command::Run(args) => {
            tracing::info!(
                output_dir = %config.output_dir.display(),
                program = %config.timer.program,
                "kex-bench starting"
            );
            let mut orchestrator =
                ExperimentOrchestrator::new(config, runner)?.with_resume(args.resume);
            let summary = orchestrator.run()?;
            for tier in &summary.files {
                println!("{}", tier.file.path.display());
            }
        }
    }

    Ok(())
}
