//! daq_routine command-line runner.
//!
//! Runs a routine definition against simulated hardware, or validates the
//! effective configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_routine::config::{ApplicationSettings, Settings};
use daq_routine::events::{RoutineEvent, RoutineOutcome};
use daq_routine::resources::{InMemoryResourceRegistry, MeasurementLayout};
use daq_routine::routine::{Hardware, Lab, Routine, RoutineRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "daq_routine", version, about = "Run multi-phase experiment routines")]
struct Cli {
    /// Settings file (TOML). Environment variables prefixed DAQ_ROUTINE_ override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a routine on simulated hardware.
    Run {
        /// Routine definition (TOML).
        #[arg(short, long)]
        routine: PathBuf,
        /// Acknowledge operator checkpoints without waiting for input.
        #[arg(long)]
        auto_ack: bool,
    },
    /// Validate and print the effective settings.
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path).with_context(|| format!("load settings {}", path.display()))?,
        None => Settings::load().context("load settings")?,
    };

    match cli.command {
        Command::Run { routine, auto_ack } => {
            init_tracing(&settings.application);
            cmd_run(settings, &routine, auto_ack).await
        }
        Command::CheckConfig => cmd_check_config(&settings),
    }
}

fn init_tracing(settings: &ApplicationSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cmd_check_config(settings: &Settings) -> Result<()> {
    let rendered = toml::to_string_pretty(settings).context("serialize settings")?;
    println!("{rendered}");
    Ok(())
}

async fn cmd_run(settings: Settings, routine_path: &Path, auto_ack: bool) -> Result<()> {
    let routine =
        Routine::load(routine_path).with_context(|| format!("load routine {}", routine_path.display()))?;
    let registry = Arc::new(InMemoryResourceRegistry::new());
    let layout = MeasurementLayout::create(
        &settings.application.data_dir,
        &routine.name,
        &routine,
        registry.as_ref(),
    )
    .context("create measurement directories")?;
    info!(
        routine = %routine.name,
        root = %layout.root.display(),
        nominal = ?routine.nominal_duration(),
        "Measurement prepared"
    );

    let lab = Lab::start(&settings, Hardware::simulated(), registry);
    let mut events = lab.events().subscribe();
    let handle = RoutineRunner::spawn(&routine, Arc::clone(&lab), settings.routine.clone());
    let progress = handle.progress();

    let mut operator = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut awaiting = false;
    let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RoutineEvent::SlotProgressed { name, .. }) => info!(slot = %name, "Slot running"),
                Ok(RoutineEvent::AwaitingOperator { name, .. }) => {
                    if auto_ack {
                        info!(slot = %name, "Acknowledging operator checkpoint");
                        handle.acknowledge();
                    } else {
                        info!(slot = %name, "Waiting for operator, press Enter to continue");
                        awaiting = true;
                    }
                }
                Ok(RoutineEvent::RoutineEnded { .. }) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener lagged"),
            },
            line = operator.next_line(), if awaiting => {
                if let Err(e) = line {
                    warn!(error = %e, "Could not read operator input");
                }
                awaiting = false;
                handle.acknowledge();
            }
            _ = ticker.tick() => {
                info!(overall = %format!("{:.1}%", progress.overall()), "Routine progress");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping routine");
                handle.stop();
            }
        }
    }

    let outcome = handle.join().await;
    lab.shutdown().await;

    match outcome {
        RoutineOutcome::Completed => {
            info!("Routine completed");
            Ok(())
        }
        RoutineOutcome::Stopped => {
            info!("Routine stopped before completion");
            Ok(())
        }
        RoutineOutcome::Aborted(reason) => bail!("routine aborted: {reason}"),
    }
}
