//! CLI entry point for the spectral calibration bench.
//!
//! ```bash
//! spectral_cal run --series sequences/demo.series
//! spectral_cal plan --series sequences/demo.series
//! spectral_cal validate --config config/bench.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spectral_cal::bench::{self, Bench, RunOutcome};
use spectral_cal::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use spectral_cal::tracing_setup;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "spectral_cal")]
#[command(about = "Spectral calibration bench automation", long_about = None)]
struct Cli {
    /// Bench configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a series on the configured bench
    Run {
        /// Series file (one sequence file name per line)
        #[arg(long)]
        series: PathBuf,
    },

    /// Print the control loop of a series as JSON without moving hardware
    Plan {
        /// Series file (one sequence file name per line)
        #[arg(long)]
        series: PathBuf,
    },

    /// Check the configuration and build every instrument
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing_setup::init_from_config(&config)?;

    match cli.command {
        Commands::Run { series } => run(&config, &series).await,
        Commands::Plan { series } => plan(&config, &series),
        Commands::Validate => validate(&config).await,
    }
}

async fn run(config: &BenchConfig, series_path: &Path) -> Result<()> {
    let series = bench::load_series(series_path, &config.storage.output_dir)?;
    let bench = Bench::from_config(config).await?;

    let interrupt = CancellationToken::new();
    let on_ctrl_c = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let summary = bench.run_series(series, interrupt).await?;
    match summary.outcome {
        RunOutcome::Complete => println!(
            "Run {} complete: {} steps, {} archived",
            summary.run_uid.as_deref().unwrap_or("-"),
            summary.steps,
            summary.archived.len()
        ),
        RunOutcome::Aborted => println!(
            "Run {} aborted after {} of {} steps",
            summary.run_uid.as_deref().unwrap_or("-"),
            summary.archived.len(),
            summary.steps
        ),
    }
    Ok(())
}

fn plan(config: &BenchConfig, series_path: &Path) -> Result<()> {
    let series = bench::load_series(series_path, &config.storage.output_dir)?;
    let control_loop = bench::plan(&series)?;
    println!("{}", serde_json::to_string_pretty(&control_loop)?);
    Ok(())
}

async fn validate(config: &BenchConfig) -> Result<()> {
    let bench = Bench::from_config(config).await?;
    println!("Configuration OK: {}", config.application.name);
    for info in bench.registry().list() {
        println!(
            "  {:<10} {:<14} {}",
            info.id,
            info.driver_type.as_deref().unwrap_or("-"),
            if info.measurable { "measurable" } else { "" }
        );
    }
    Ok(())
}
