//! Errors raised while configuring or running the state machine and while
//! expanding sequences into a control loop.

use crate::machine::ControlMessage;
use thiserror::Error;

/// State machine configuration and runtime errors.
///
/// Action failures are not represented here: they park the machine in its
/// error state instead of propagating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// Two states share a name.
    #[error("State '{0}' is already registered")]
    DuplicateState(String),

    /// A second state was marked idle.
    #[error("Cannot mark '{new}' as the idle state: '{existing}' already is")]
    DuplicateIdle {
        /// State already marked idle
        existing: String,
        /// State that tried to become idle
        new: String,
    },

    /// A second state was marked initial.
    #[error("Cannot mark '{new}' as the initial state: '{existing}' already is")]
    DuplicateInitial {
        /// State already marked initial
        existing: String,
        /// State that tried to become initial
        new: String,
    },

    /// A transition names a state that does not exist.
    #[error("Unknown state '{0}'")]
    UnknownState(String),

    /// No state was marked initial.
    #[error("No initial state marked")]
    NoInitialState,

    /// A control message arrived but there is no idle state to go to.
    #[error("No idle state marked, cannot handle '{0}'")]
    NoIdleState(ControlMessage),

    /// A state finished and none of its transitions matched.
    #[error("State machine stuck in '{state}': no transition matched")]
    Stuck {
        /// State that could not be left
        state: String,
    },

    /// A control token other than `abort`/`pause`.
    #[error("Unknown control token '{0}'")]
    UnknownControlToken(String),

    /// The machine is no longer receiving messages.
    #[error("State machine is not running")]
    Stopped,
}

/// Malformed sequence or series input to the control-loop builder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    /// Non-positive step or non-finite bounds.
    #[error("Sequence '{sequence}': invalid wavelength range start={start} stop={stop} step={step}")]
    InvalidRange {
        /// Sequence name
        sequence: String,
        /// Start wavelength
        start: f64,
        /// Stop wavelength (exclusive)
        stop: f64,
        /// Step
        step: f64,
    },

    /// A transition table has no entries.
    #[error("Sequence '{sequence}': '{instrument}' has an empty {table} transition table")]
    EmptyTransitionTable {
        /// Sequence name
        sequence: String,
        /// Instrument id
        instrument: String,
        /// Which table
        table: &'static str,
    },

    /// A wavelength-dependent section without a monochromator section.
    #[error("Sequence '{sequence}': '{instrument}' depends on monochromator wavelengths but the sequence has no monochromator")]
    MissingWavelengths {
        /// Sequence name
        sequence: String,
        /// First instrument left without wavelengths
        instrument: String,
    },

    /// More than one monochromator section in one sequence.
    #[error("Sequence '{sequence}': more than one monochromator section")]
    DuplicateMonochromator {
        /// Sequence name
        sequence: String,
    },

    /// The same instrument id twice in one sequence.
    #[error("Sequence '{sequence}': instrument '{instrument}' appears more than once")]
    DuplicateInstrument {
        /// Sequence name
        sequence: String,
        /// Instrument id
        instrument: String,
    },

    /// The same instrument id used with two different kinds across a series.
    #[error("Instrument '{instrument}' is used as both {first} and {second}")]
    ConflictingKind {
        /// Instrument id
        instrument: String,
        /// Kind seen first
        first: String,
        /// Conflicting kind
        second: String,
    },

    /// Per-instrument command lists of different lengths.
    #[error("Control loop misaligned: '{instrument}' has {actual} steps, expected {expected}")]
    Misaligned {
        /// Instrument id
        instrument: String,
        /// Its number of steps
        actual: usize,
        /// Control loop length
        expected: usize,
    },
}
