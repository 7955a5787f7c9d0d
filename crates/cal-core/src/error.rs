//! Error types shared across the calibration bench.
//!
//! Instrument drivers report failures through [`DriverError`], which carries a
//! coarse [`DriverErrorKind`] so the state machine can log something more
//! useful than a bare string. Everything else funnels into [`CalError`].

use std::fmt;
use thiserror::Error;

/// Broad category of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Link to the instrument failed (serial, GPIB, TCP, DLL call).
    Communication,
    /// The instrument reported a fault.
    Hardware,
    /// A parameter value was rejected.
    InvalidParameter,
    /// The instrument did not answer in time.
    Timeout,
    /// The operation was abandoned because the caller cancelled it.
    Cancelled,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Communication => "communication",
            Self::Hardware => "hardware",
            Self::InvalidParameter => "invalid parameter",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Structured error raised by an instrument driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Instrument '{instrument}' {kind} error: {message}")]
pub struct DriverError {
    /// Instrument id or driver type that failed
    pub instrument: String,
    /// Failure category
    pub kind: DriverErrorKind,
    /// Human-readable details
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        instrument: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, CalError>;

/// Primary error type for the calibration bench.
///
/// Configuration problems are permanent and surface at startup. Instrument
/// and driver errors happen while the state machine runs; the machine turns
/// them into its error flag rather than propagating them.
#[derive(Error, Debug)]
pub enum CalError {
    /// Configuration values parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure (archive files, sequence files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unstructured instrument failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Structured driver error with category.
    #[error("{0}")]
    Driver(DriverError),

    /// No instrument registered under the requested id.
    #[error("Instrument '{0}' is not registered")]
    UnknownInstrument(String),

    /// An instrument with this id was already registered.
    #[error("Instrument '{0}' is already registered")]
    DuplicateInstrument(String),
}

impl From<DriverError> for CalError {
    fn from(err: DriverError) -> Self {
        CalError::Driver(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display_names_instrument_and_kind() {
        let err = DriverError::new("cs260", DriverErrorKind::Timeout, "no reply");
        assert_eq!(err.to_string(), "Instrument 'cs260' timeout error: no reply");
    }

    #[test]
    fn driver_error_converts_into_cal_error() {
        let err: CalError = DriverError::new("sr830", DriverErrorKind::Hardware, "overload").into();
        assert!(matches!(err, CalError::Driver(ref d) if d.kind == DriverErrorKind::Hardware));
    }
}
