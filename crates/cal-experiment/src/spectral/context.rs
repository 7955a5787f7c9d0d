//! Session context of the spectral calibration machine.

use super::{CONTROL_LOOP_COMPLETE, MODE, WAITING_COMPLETE};
use crate::args::SharedArgs;
use crate::control_loop::{ControlLoop, ControlLoopBuilder};
use crate::machine::{ControlMessage, MachineContext};
use crate::sequence::Series;
use async_trait::async_trait;
use cal_core::{
    Measurement, MeasurementSummary, MessageLevel, MessageLog, Parameters, Sink, ViewerEvent,
};
use cal_hardware::InstrumentRegistry;
use cal_storage::{ExpIdGenerator, JsonArchive, SampleCsvWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Default depth of the input channel.
pub const DEFAULT_INPUT_CAPACITY: usize = 8;

/// Runner switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectralSettings {
    /// Append records to the daily JSON archive.
    pub write_json: bool,
    /// Append raw samples to per-sequence CSV files.
    pub write_csv: bool,
    /// Depth of the input channel.
    pub input_capacity: usize,
    /// Depth of the control channel.
    pub control_capacity: usize,
}

impl Default for SpectralSettings {
    fn default() -> Self {
        Self {
            write_json: true,
            write_csv: true,
            input_capacity: DEFAULT_INPUT_CAPACITY,
            control_capacity: crate::machine::DEFAULT_CONTROL_CAPACITY,
        }
    }
}

/// Parameters to apply by hand, keyed by instrument id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualCommand {
    /// Instrument id → parameters.
    pub commands: BTreeMap<String, Parameters>,
}

impl ManualCommand {
    /// Empty command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add parameters for one instrument.
    pub fn with(mut self, instrument: impl Into<String>, parameters: Parameters) -> Self {
        self.commands.insert(instrument.into(), parameters);
        self
    }
}

/// What the idle state accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineInput {
    /// Apply parameters once, then return to waiting.
    Manual(ManualCommand),
    /// Run a series.
    Auto(Series),
}

/// Position of the runner in the current control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopIndices {
    /// Flat step index.
    pub control_loop_index: usize,
    /// Sequence within the series.
    pub series_index: usize,
    /// Step within the sequence.
    pub sequence_index: usize,
}

/// Mutable state of the current run. Never held across an await.
#[derive(Default)]
pub(crate) struct RunState {
    pub(crate) pending: Option<MachineInput>,
    pub(crate) control_loop: Option<Arc<ControlLoop>>,
    pub(crate) indices: LoopIndices,
    /// Last step whose record reached the archive.
    pub(crate) last_archived: Option<usize>,
    pub(crate) run_uid: Option<String>,
    pub(crate) exp_ids: Option<ExpIdGenerator>,
    pub(crate) readbacks: BTreeMap<String, Parameters>,
    pub(crate) requested: Vec<String>,
    pub(crate) measurements: BTreeMap<String, Measurement>,
    pub(crate) summaries: BTreeMap<String, MeasurementSummary>,
}

impl RunState {
    fn clear_step(&mut self) {
        self.readbacks.clear();
        self.requested.clear();
        self.measurements.clear();
        self.summaries.clear();
    }

    fn discard_progress(&mut self) {
        self.control_loop = None;
        self.indices = LoopIndices::default();
        self.last_archived = None;
        self.run_uid = None;
        self.exp_ids = None;
        self.clear_step();
    }

    /// Move the saved index past a step archived before Resetting advanced it.
    fn skip_archived(&mut self) {
        let Some(done) = self.last_archived else {
            return;
        };
        if self.indices.control_loop_index > done {
            return;
        }
        let next = done + 1;
        self.indices.control_loop_index = next;
        if let Some((series_index, sequence_index)) =
            self.control_loop.as_ref().and_then(|cl| cl.position(next))
        {
            self.indices.series_index = series_index;
            self.indices.sequence_index = sequence_index;
        }
    }
}

/// Everything the spectral states share.
pub struct SpectralContext {
    args: SharedArgs,
    pub(crate) registry: Arc<InstrumentRegistry>,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) archive: JsonArchive,
    pub(crate) csv: SampleCsvWriter,
    pub(crate) builder: ControlLoopBuilder,
    pub(crate) settings: SpectralSettings,
    pub(crate) input: tokio::sync::Mutex<mpsc::Receiver<MachineInput>>,
    pub(crate) run: Mutex<RunState>,
    paused: AtomicBool,
    messages: MessageLog,
}

impl SpectralContext {
    /// Context plus the sender side of its input channel.
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        sink: Arc<dyn Sink>,
        settings: SpectralSettings,
    ) -> (Self, mpsc::Sender<MachineInput>) {
        let (tx, rx) = mpsc::channel(settings.input_capacity.max(1));
        let ctx = Self {
            args: SharedArgs::new(),
            registry,
            sink,
            archive: JsonArchive::new(),
            csv: SampleCsvWriter,
            builder: ControlLoopBuilder,
            settings,
            input: tokio::sync::Mutex::new(rx),
            run: Mutex::new(RunState::default()),
            paused: AtomicBool::new(false),
            messages: MessageLog::new(),
        };
        (ctx, tx)
    }

    /// Current loop indices.
    pub fn indices(&self) -> LoopIndices {
        self.run.lock().indices
    }

    /// Control loop of the current run.
    pub fn control_loop(&self) -> Option<Arc<ControlLoop>> {
        self.run.lock().control_loop.clone()
    }

    /// Id of the current run.
    pub fn run_uid(&self) -> Option<String> {
        self.run.lock().run_uid.clone()
    }

    /// Whether a paused run is waiting to be resumed.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Operator message log.
    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Instrument registry.
    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn take_paused(&self) -> bool {
        self.paused.swap(false, Ordering::SeqCst)
    }

    /// Log an operator message and mirror it to the viewer.
    pub(crate) fn notify(&self, level: MessageLevel, text: impl Into<String>) {
        let text = text.into();
        self.messages.push(level, text.clone());
        self.sink.emit_to_viewer(ViewerEvent::Message { text });
    }

    /// Record that the step at `index` is in the archive.
    pub(crate) fn mark_archived(&self, index: usize) {
        self.run.lock().last_archived = Some(index);
    }

    /// Control loop and flat index of the step being executed.
    pub(crate) fn current_step(&self) -> anyhow::Result<(Arc<ControlLoop>, usize)> {
        let run = self.run.lock();
        let control_loop = run
            .control_loop
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No control loop is active"))?;
        Ok((control_loop, run.indices.control_loop_index))
    }

    /// Reset shared args and per-run data on entering the idle state. A
    /// paused run keeps its indices.
    pub(crate) fn reset_for_waiting(&self) {
        self.args.set(MODE, Value::Null);
        self.args.set(WAITING_COMPLETE, false);
        self.args.set(CONTROL_LOOP_COMPLETE, false);

        let paused = self.is_paused();
        let mut run = self.run.lock();
        run.pending = None;
        if paused {
            run.control_loop = None;
            run.clear_step();
        } else {
            run.discard_progress();
        }
    }
}

#[async_trait]
impl MachineContext for SpectralContext {
    fn args(&self) -> &SharedArgs {
        &self.args
    }

    fn state_entered(&self, state: &str) {
        self.sink.emit_to_viewer(ViewerEvent::StateEntered {
            state: state.to_string(),
        });
    }

    async fn interrupted(&self, state: &str, message: ControlMessage) {
        self.args.set(CONTROL_LOOP_COMPLETE, false);
        match message {
            ControlMessage::Abort => {
                self.run.lock().discard_progress();
                self.set_paused(false);
                for (id, e) in self.registry.abort_all().await {
                    self.notify(
                        MessageLevel::Warning,
                        format!("Abort of '{}' failed: {:#}", id, e),
                    );
                }
                warn!(state, "Run aborted, progress discarded");
                self.notify(
                    MessageLevel::Warning,
                    format!("Aborted during {}", state),
                );
            }
            ControlMessage::Pause => {
                self.set_paused(true);
                let indices = {
                    let mut run = self.run.lock();
                    run.skip_archived();
                    run.indices
                };
                info!(
                    state,
                    index = indices.control_loop_index,
                    "Run paused"
                );
                self.notify(
                    MessageLevel::Info,
                    format!(
                        "Paused during {} at step {}",
                        state, indices.control_loop_index
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{MonochromatorSection, Sequence};
    use crate::transition_table::{GratingTransition, OsfTransition};
    use cal_core::BroadcastSink;

    fn context_with_run(index: usize, last_archived: Option<usize>) -> SpectralContext {
        let series = Series::new(vec![Sequence::new("s").with_instrument(MonochromatorSection {
            id: "cs260".into(),
            start_wavelength: 0.5,
            stop_wavelength: 0.65,
            step_wavelength: 0.05,
            shutter: Default::default(),
            grating_transitions: vec![GratingTransition { wavelength: 0.0, grating: 1 }],
            osf_transitions: vec![OsfTransition { wavelength: 0.0, osf: 1 }],
        })]);
        let control_loop = ControlLoopBuilder.build(&series).unwrap();
        let (ctx, _input) = SpectralContext::new(
            Arc::new(InstrumentRegistry::new()),
            Arc::new(BroadcastSink::new(16)),
            SpectralSettings::default(),
        );
        {
            let mut run = ctx.run.lock();
            run.control_loop = Some(Arc::new(control_loop));
            run.indices = LoopIndices {
                control_loop_index: index,
                series_index: 0,
                sequence_index: index,
            };
            run.last_archived = last_archived;
        }
        ctx
    }

    #[tokio::test]
    async fn pause_after_archiving_resumes_at_next_step() {
        let ctx = context_with_run(1, Some(1));
        ctx.interrupted("Archiving", ControlMessage::Pause).await;

        assert!(ctx.is_paused());
        assert_eq!(
            ctx.indices(),
            LoopIndices {
                control_loop_index: 2,
                series_index: 0,
                sequence_index: 2,
            }
        );
    }

    #[tokio::test]
    async fn pause_before_archiving_keeps_current_step() {
        let ctx = context_with_run(2, Some(1));
        ctx.interrupted("Measuring", ControlMessage::Pause).await;
        assert_eq!(ctx.indices().control_loop_index, 2);

        let fresh = context_with_run(0, None);
        fresh.interrupted("Moving", ControlMessage::Pause).await;
        assert_eq!(fresh.indices().control_loop_index, 0);
    }

    #[tokio::test]
    async fn abort_forgets_archived_step() {
        let ctx = context_with_run(1, Some(1));
        ctx.interrupted("Archiving", ControlMessage::Abort).await;
        assert_eq!(ctx.indices(), LoopIndices::default());
        assert_eq!(ctx.run.lock().last_archived, None);
    }
}
