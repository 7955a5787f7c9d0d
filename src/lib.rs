//! # Spectral Calibration Bench
//!
//! Application crate for the spectral calibration bench. The experiment engine
//! lives in the workspace crates; this crate wires them to a configuration
//! file and a command line.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based bench configuration (`config/bench.toml` plus
//!   `SPECTRAL_CAL_` environment overrides).
//! - **`tracing_setup`**: `tracing-subscriber` installation driven by the
//!   `[application]` section.
//! - **`bench`**: builds the instrument registry and the spectral machine and
//!   drives a series to completion.
//!
//! ## Workspace
//!
//! - `cal-core`: instrument facade, parameters, measurement data, sink events
//! - `cal-driver-mock`: simulated monochromator, lock-ins, NDF wheel, detector
//! - `cal-hardware`: instrument registry and factories
//! - `cal-storage`: JSON archive, CSV samples, experiment ids
//! - `cal-experiment`: state machine, sequences, control-loop builder, runner

pub mod bench;
pub mod config;
pub mod tracing_setup;

pub use bench::{Bench, RunOutcome, RunSummary};
pub use config::BenchConfig;
