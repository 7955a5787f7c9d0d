//! `cal-core`
//!
//! Core trait definitions and types for the spectral calibration bench.
//!
//! The experiment state machine depends only on what lives here:
//!
//! - [`capabilities`]: the [`Instrument`] facade (`open` / `get_parameters` /
//!   `set_parameters` / `abort`), [`Measurable`], and the blocking
//!   [`SyncInstrument`] variant with its [`SyncAdapter`].
//! - [`parameters`]: parameter maps, queries and diffing.
//! - [`data`]: measurement requests, samples and summaries.
//! - [`sink`]: viewer/recorder events and the [`Sink`] trait.
//! - [`messages`]: bounded operator message log.
//! - [`driver`]: instrument factories for config-driven registration.
//! - [`error`]: [`CalError`] and [`DriverError`].

pub mod capabilities;
pub mod data;
pub mod driver;
pub mod error;
pub mod messages;
pub mod parameters;
pub mod sink;

pub use capabilities::{Instrument, Measurable, SyncAdapter, SyncInstrument};
pub use data::{ChannelStats, MeasureRequest, Measurement, MeasurementSummary, Sample};
pub use driver::{InstrumentComponents, InstrumentFactory};
pub use error::{AppResult, CalError, DriverError, DriverErrorKind};
pub use messages::{Message, MessageLevel, MessageLog};
pub use parameters::{diff, values_match, ParameterQuery, Parameters};
pub use sink::{ArchiveRecord, BroadcastSink, RecorderEvent, Sink, ViewerEvent};
