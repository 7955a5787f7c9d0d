//! The spectral calibration machine.
//!
//! ```text
//! Initializing → Waiting
//! Waiting      → Thinking (auto) | Manual (manual)
//! Manual       → Waiting
//! Thinking     → Moving
//! Moving       → Waiting (control loop complete) | Measuring
//! Measuring → Checking → Compressing → Archiving → Resetting → Moving
//! ```
//!
//! Waiting is the idle state: abort or pause anywhere else returns there.

mod context;
mod moves;
mod states;

pub use context::{
    LoopIndices, MachineInput, ManualCommand, SpectralContext, SpectralSettings,
    DEFAULT_INPUT_CAPACITY,
};
pub use moves::{apply_parameters, plan_moves};
pub use states::{build_metadata, metadata_key};

use crate::error::MachineError;
use crate::machine::{Guard, MachineHandle, State, StateMachine, StateMachineBuilder};
use crate::sequence::Series;
use cal_core::Sink;
use cal_hardware::InstrumentRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opens instruments.
pub const INITIALIZING: &str = "Initializing";
/// Idle; waits for input.
pub const WAITING: &str = "Waiting";
/// Builds the control loop.
pub const THINKING: &str = "Thinking";
/// Applies a manual command.
pub const MANUAL: &str = "Manual";
/// Moves instruments to the current step.
pub const MOVING: &str = "Moving";
/// Acquires data.
pub const MEASURING: &str = "Measuring";
/// Validates the acquisition.
pub const CHECKING: &str = "Checking";
/// Summarises samples.
pub const COMPRESSING: &str = "Compressing";
/// Writes the record.
pub const ARCHIVING: &str = "Archiving";
/// Advances the step index.
pub const RESETTING: &str = "Resetting";

/// Shared argument: `"auto"` or `"manual"` once input arrived.
pub const MODE: &str = "mode";
/// `MODE` value for a series run.
pub const MODE_AUTO: &str = "auto";
/// `MODE` value for a manual command.
pub const MODE_MANUAL: &str = "manual";
/// Shared argument: input received.
pub const WAITING_COMPLETE: &str = "waiting_complete";
/// Shared argument: every step executed.
pub const CONTROL_LOOP_COMPLETE: &str = "control_loop_complete";

/// Handle for submitting work to and controlling a spectral machine.
#[derive(Clone, Debug)]
pub struct SpectralHandle {
    machine: MachineHandle,
    input: mpsc::Sender<MachineInput>,
}

impl SpectralHandle {
    /// Hand input to the waiting state.
    pub async fn submit(&self, input: MachineInput) -> Result<(), MachineError> {
        self.input
            .send(input)
            .await
            .map_err(|_| MachineError::Stopped)
    }

    /// Run a series.
    pub async fn run_series(&self, series: Series) -> Result<(), MachineError> {
        self.submit(MachineInput::Auto(series)).await
    }

    /// Apply a manual command.
    pub async fn apply(&self, command: ManualCommand) -> Result<(), MachineError> {
        self.submit(MachineInput::Manual(command)).await
    }

    /// Abort the current run.
    pub async fn abort(&self) -> Result<(), MachineError> {
        self.machine.abort().await
    }

    /// Pause the current run.
    pub async fn pause(&self) -> Result<(), MachineError> {
        self.machine.pause().await
    }

    /// Send `"abort"` or `"pause"`.
    pub async fn send_token(&self, token: &str) -> Result<(), MachineError> {
        self.machine.send_token(token).await
    }

    /// Stop the machine.
    pub fn shutdown(&self) {
        self.machine.shutdown();
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.machine.shutdown_token()
    }
}

/// A ready-to-run spectral calibration machine.
pub struct SpectralMachine {
    /// The machine; drive it with `run` or `step`.
    pub machine: StateMachine<SpectralContext>,
    /// Control handle.
    pub handle: SpectralHandle,
}

impl SpectralMachine {
    /// Assemble the machine around `registry` and `sink`.
    pub fn build(
        registry: Arc<InstrumentRegistry>,
        sink: Arc<dyn Sink>,
        settings: SpectralSettings,
    ) -> Result<Self, MachineError> {
        let control_capacity = settings.control_capacity;
        let (ctx, input) = SpectralContext::new(registry, sink, settings);

        let mut builder: StateMachineBuilder<SpectralContext> =
            StateMachine::builder().control_capacity(control_capacity);
        builder
            .add_state(State::new(INITIALIZING).initial().with_async_action("initialize", states::initialize))?
            .add_state(State::new(WAITING).idle().with_async_action("wait_for_input", states::wait_for_input))?
            .add_state(State::new(THINKING).with_action("plan_run", states::plan_run))?
            .add_state(State::new(MANUAL).with_async_action("apply_manual", states::apply_manual))?
            .add_state(State::new(MOVING).with_async_action("move_instruments", states::move_instruments))?
            .add_state(State::new(MEASURING).with_async_action("measure", states::measure))?
            .add_state(State::new(CHECKING).with_action("check_step", states::check_step))?
            .add_state(State::new(COMPRESSING).with_action("compress", states::compress))?
            .add_state(State::new(ARCHIVING).with_async_action("archive", states::archive))?
            .add_state(State::new(RESETTING).with_action("advance", states::advance))?;

        builder
            .add_transition("init_to_wait", INITIALIZING, WAITING, Guard::Always)?
            .add_transition("wait_to_think", WAITING, THINKING, Guard::when(MODE, MODE_AUTO))?
            .add_transition("wait_to_manual", WAITING, MANUAL, Guard::when(MODE, MODE_MANUAL))?
            .add_transition("manual_to_wait", MANUAL, WAITING, Guard::Always)?
            .add_transition("think_to_move", THINKING, MOVING, Guard::Always)?
            .add_transition("move_to_wait", MOVING, WAITING, Guard::when(CONTROL_LOOP_COMPLETE, true))?
            .add_transition("move_to_measure", MOVING, MEASURING, Guard::Always)?
            .add_transition("measure_to_check", MEASURING, CHECKING, Guard::Always)?
            .add_transition("check_to_compress", CHECKING, COMPRESSING, Guard::Always)?
            .add_transition("compress_to_archive", COMPRESSING, ARCHIVING, Guard::Always)?
            .add_transition("archive_to_reset", ARCHIVING, RESETTING, Guard::Always)?
            .add_transition("reset_to_move", RESETTING, MOVING, Guard::Always)?;

        builder.error_handler(states::report_fault);

        let (machine, handle) = builder.build(Arc::new(ctx))?;
        Ok(Self {
            machine,
            handle: SpectralHandle {
                machine: handle,
                input,
            },
        })
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<SpectralContext> {
        self.machine.context()
    }
}
