//! Experiment engine for the spectral calibration bench.
//!
//! - [`machine`]: generic async state machine with abort/pause control
//! - [`sequence`]: sequence and series model, file I/O
//! - [`transition_table`]: wavelength-threshold tables
//! - [`control_loop`]: expands a series into step-aligned instrument commands
//! - [`spectral`]: the calibration machine built on the above

pub mod args;
pub mod control_loop;
pub mod error;
pub mod machine;
pub mod sequence;
pub mod spectral;
pub mod transition_table;

pub use args::SharedArgs;
pub use control_loop::{ControlLoop, ControlLoopBuilder, SequenceSpan, StepCommand};
pub use error::{BuildError, MachineError};
pub use machine::{
    ControlMessage, Guard, MachineContext, MachineFault, MachineHandle, State, StateMachine,
    StateMachineBuilder, StepOutcome,
};
pub use sequence::{InstrumentKind, InstrumentSection, MetadataFlags, Sequence, Series};
pub use spectral::{
    LoopIndices, MachineInput, ManualCommand, SpectralContext, SpectralHandle, SpectralMachine,
    SpectralSettings,
};
