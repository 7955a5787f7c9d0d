//! Bench assembly: configured instruments, output sink and the spectral
//! machine, wired together and driven to the end of a series.

use crate::config::BenchConfig;
use anyhow::{bail, Context, Result};
use cal_core::{BroadcastSink, MessageLevel, ViewerEvent};
use cal_experiment::{
    ControlLoop, ControlLoopBuilder, Series, SpectralContext, SpectralHandle, SpectralMachine,
};
use cal_hardware::{create_registry_from_definitions, InstrumentRegistry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Buffered viewer/recorder events per subscriber.
pub const SINK_CAPACITY: usize = 1024;

/// How a series run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step executed.
    Complete,
    /// Stopped by an interrupt; progress discarded.
    Aborted,
}

/// Result of [`Bench::run_series`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Unique id of the run, if it got as far as planning
    pub run_uid: Option<String>,
    /// Steps in the control loop
    pub steps: usize,
    /// Experiment ids of archived steps, in order
    pub archived: Vec<String>,
    /// How the run ended
    pub outcome: RunOutcome,
}

/// A fully wired calibration bench.
pub struct Bench {
    registry: Arc<InstrumentRegistry>,
    sink: BroadcastSink,
    machine: SpectralMachine,
    output_dir: PathBuf,
}

impl Bench {
    /// Build every enabled instrument in `config` and the machine around them.
    pub async fn from_config(config: &BenchConfig) -> Result<Self> {
        config.validate()?;
        let registry = create_registry_from_definitions(&config.instrument_definitions())
            .await
            .context("Failed to build instrument registry")?;
        info!(
            bench = %config.application.name,
            instruments = registry.len(),
            "Instrument registry ready"
        );
        Self::with_registry(Arc::new(registry), config)
    }

    /// Assemble around an existing registry.
    pub fn with_registry(registry: Arc<InstrumentRegistry>, config: &BenchConfig) -> Result<Self> {
        let sink = BroadcastSink::new(SINK_CAPACITY);
        let machine = SpectralMachine::build(
            registry.clone(),
            Arc::new(sink.clone()),
            config.spectral_settings(),
        )?;
        Ok(Self {
            registry,
            sink,
            machine,
            output_dir: config.storage.output_dir.clone(),
        })
    }

    /// Registered instruments.
    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    /// Sink the machine publishes to.
    pub fn sink(&self) -> &BroadcastSink {
        &self.sink
    }

    /// Control handle.
    pub fn handle(&self) -> SpectralHandle {
        self.machine.handle.clone()
    }

    /// Shared machine context.
    pub fn context(&self) -> Arc<SpectralContext> {
        self.machine.context().clone()
    }

    /// Resolve relative sequence storage paths against the output directory.
    pub fn prepare(&self, series: Series) -> Series {
        rebase_storage(series, &self.output_dir)
    }

    /// Run `series` to completion, or until `interrupt` fires.
    ///
    /// Storage paths are used as given; see [`Bench::prepare`]. The machine is
    /// shut down before returning. A failed action is reported as an error
    /// naming the state it failed in.
    pub async fn run_series(self, series: Series, interrupt: CancellationToken) -> Result<RunSummary> {
        let Self { sink, machine, .. } = self;
        let SpectralMachine {
            machine: mut state_machine,
            handle,
        } = machine;
        let ctx = state_machine.context().clone();

        let mut viewer = sink.subscribe_viewer();
        let runner = tokio::spawn(async move { state_machine.run().await });

        handle.run_series(series).await?;

        let mut summary = RunSummary {
            run_uid: None,
            steps: 0,
            archived: Vec::new(),
            outcome: RunOutcome::Complete,
        };
        let mut interrupted = false;
        let result = loop {
            let event = tokio::select! {
                _ = interrupt.cancelled(), if !interrupted => {
                    warn!("Interrupt received, aborting run");
                    interrupted = true;
                    handle.abort().await?;
                    continue;
                }
                event = viewer.recv() => event,
            };
            match event {
                Ok(ViewerEvent::RunStarted { run_uid, steps, .. }) => {
                    info!(%run_uid, steps, "Run started");
                    summary.run_uid = Some(run_uid);
                    summary.steps = steps;
                }
                Ok(ViewerEvent::StepArchived { exp_id, index }) => {
                    info!(%exp_id, index, "Step archived");
                    summary.archived.push(exp_id);
                }
                Ok(ViewerEvent::RunComplete { steps, .. }) => {
                    summary.steps = steps;
                    break Ok(());
                }
                Ok(ViewerEvent::Message { text }) if interrupted && text.starts_with("Aborted") => {
                    summary.outcome = RunOutcome::Aborted;
                    break Ok(());
                }
                Ok(ViewerEvent::Error { state, message }) => {
                    break Err(anyhow::anyhow!("Run failed in {}: {}", state, message));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Viewer lagged, events dropped");
                }
                Err(RecvError::Closed) => break Err(anyhow::anyhow!("Machine stopped unexpectedly")),
            }
        };

        for message in ctx.messages().drain() {
            match message.level {
                MessageLevel::Error => error!(text = %message.text, "bench message"),
                MessageLevel::Warning => warn!(text = %message.text, "bench message"),
                MessageLevel::Info => info!(text = %message.text, "bench message"),
            }
        }

        handle.shutdown();
        runner.await.context("Machine task panicked")??;
        result.map(|()| summary)
    }
}

/// Build the control loop for `series` without touching hardware.
pub fn plan(series: &Series) -> Result<ControlLoop> {
    if series.is_empty() {
        bail!("Series contains no sequences");
    }
    Ok(ControlLoopBuilder.build(series)?)
}

/// Load a series file and resolve its storage paths against `output_dir`.
pub fn load_series(path: &Path, output_dir: &Path) -> Result<Series> {
    let series =
        Series::load(path).with_context(|| format!("Failed to load series {}", path.display()))?;
    Ok(rebase_storage(series, output_dir))
}

fn rebase_storage(mut series: Series, output_dir: &Path) -> Series {
    for sequence in &mut series.sequences {
        if sequence.storage_path.is_relative() {
            sequence.storage_path = output_dir.join(&sequence.storage_path);
        }
    }
    series
}
