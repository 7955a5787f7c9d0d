//! Operational modes for mock instruments.

use cal_core::error::{DriverError, DriverErrorKind};
use serde::Deserialize;
use std::time::Duration;

/// Operational modes for mock instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for demos and integration runs
    Realistic,
}

impl MockMode {
    /// Sleep for `realistic` in realistic mode, return immediately otherwise.
    pub async fn delay(self, realistic: Duration) {
        if self == MockMode::Realistic && !realistic.is_zero() {
            tokio::time::sleep(realistic).await;
        }
    }

    /// Blocking counterpart of [`MockMode::delay`] for synchronous drivers.
    pub fn delay_blocking(self, realistic: Duration) {
        if self == MockMode::Realistic && !realistic.is_zero() {
            std::thread::sleep(realistic);
        }
    }
}

/// `secs` as a [`Duration`], rejecting negative, non-finite and overflowing
/// values instead of panicking.
pub fn checked_duration(instrument: &str, what: &str, secs: f64) -> Result<Duration, DriverError> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        DriverError::new(
            instrument,
            DriverErrorKind::InvalidParameter,
            format!("{what} of {secs} s is out of range: {e}"),
        )
    })
}

/// Time between samples at `sample_rate` Hz.
pub fn sample_period(instrument: &str, sample_rate: f64) -> Result<Duration, DriverError> {
    if sample_rate.is_nan() || sample_rate <= 0.0 {
        return Err(DriverError::new(
            instrument,
            DriverErrorKind::InvalidParameter,
            format!("sample rate must be positive, got {sample_rate}"),
        ));
    }
    checked_duration(instrument, "sample period", 1.0 / sample_rate)
}
