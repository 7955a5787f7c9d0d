//! Mock S401C thermal power detector.
//!
//! The detector is told the active wavelength (in nm) so it can apply its
//! responsivity correction, and reports power in watts.

use crate::common::params::{get_f64, reject_unknown};
use crate::common::mode::sample_period;
use crate::common::{FaultConfig, FaultInjector, MockMode};
use anyhow::{bail, Result};
use async_trait::async_trait;
use cal_core::driver::{InstrumentComponents, InstrumentFactory};
use cal_core::error::{DriverError, DriverErrorKind};
use cal_core::{Instrument, MeasureRequest, Measurable, Measurement, ParameterQuery, Parameters, Sample};
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Configuration for the mock detector
#[derive(Debug, Clone, Deserialize)]
pub struct MockDetectorConfig {
    /// Peak power in watts
    #[serde(default = "default_peak_power")]
    pub peak_power: f64,
    /// Wavelength of peak response in nm
    #[serde(default = "default_peak_nm")]
    pub peak_wavelength_nm: f64,
    /// Timing mode
    #[serde(default)]
    pub mode: MockMode,
    /// Fault injection
    #[serde(default)]
    pub faults: FaultConfig,
}

fn default_peak_power() -> f64 {
    2.0e-6
}

fn default_peak_nm() -> f64 {
    1000.0
}

impl Default for MockDetectorConfig {
    fn default() -> Self {
        Self {
            peak_power: default_peak_power(),
            peak_wavelength_nm: default_peak_nm(),
            mode: MockMode::Instant,
            faults: FaultConfig::default(),
        }
    }
}

/// Factory for [`MockDetector`] (`type = "mock_s401c"`).
pub struct MockDetectorFactory;

impl InstrumentFactory for MockDetectorFactory {
    fn driver_type(&self) -> &'static str {
        "mock_s401c"
    }

    fn name(&self) -> &'static str {
        "Mock S401C Thermal Power Detector"
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: MockDetectorConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(
        &self,
        id: String,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<InstrumentComponents>> {
        Box::pin(async move {
            let cfg: MockDetectorConfig = config.try_into()?;
            let detector = Arc::new(MockDetector::with_config(id, cfg));
            Ok(InstrumentComponents::new(detector.clone()).with_measurable(detector))
        })
    }
}

/// Simulated thermal detector.
pub struct MockDetector {
    id: String,
    config: MockDetectorConfig,
    // (wavelength nm, sample rate Hz)
    state: RwLock<(f64, f64)>,
    faults: FaultInjector,
}

impl MockDetector {
    /// Detector with default response.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, MockDetectorConfig::default())
    }

    /// Detector from a config table.
    pub fn with_config(id: impl Into<String>, config: MockDetectorConfig) -> Self {
        let id = id.into();
        Self {
            faults: FaultInjector::new(id.clone(), config.faults.clone()),
            id,
            config,
            state: RwLock::new((1000.0, 10.0)),
        }
    }

    fn power_at(&self, wavelength_nm: f64) -> f64 {
        let offset = (wavelength_nm - self.config.peak_wavelength_nm) / self.config.peak_wavelength_nm;
        self.config.peak_power * (-offset * offset * 4.0).exp()
    }
}

#[async_trait]
impl Instrument for MockDetector {
    fn open(&self) -> Result<()> {
        self.faults.check("open")?;
        Ok(())
    }

    async fn get_parameters(&self, query: &ParameterQuery) -> Result<Parameters> {
        self.faults.check("get_parameters")?;
        let (wavelength, sample_rate) = *self.state.read().await;
        let mut p = Parameters::new();
        p.insert("wavelength".into(), json!(wavelength));
        p.insert("sample_rate".into(), json!(sample_rate));
        Ok(query.select(&p))
    }

    async fn set_parameters(&self, params: &Parameters) -> Result<()> {
        self.faults.check("set_parameters")?;
        reject_unknown(params, &["wavelength", "sample_rate"], &self.id)?;
        let wavelength = get_f64(params, "wavelength")?;
        let sample_rate = get_f64(params, "sample_rate")?;
        if let Some(rate) = sample_rate {
            if rate <= 0.0 {
                bail!("{}: sample_rate must be positive", self.id);
            }
        }
        let mut state = self.state.write().await;
        if let Some(w) = wavelength {
            state.0 = w;
        }
        if let Some(r) = sample_rate {
            state.1 = r;
        }
        Ok(())
    }
}

#[async_trait]
impl Measurable for MockDetector {
    async fn measure(
        &self,
        request: &MeasureRequest,
        cancel: &CancellationToken,
    ) -> Result<Measurement> {
        self.faults.check("measure")?;
        let (wavelength, _) = *self.state.read().await;
        let power = self.power_at(wavelength);
        let period = sample_period(&self.id, request.sample_rate)?;

        let mut measurement = Measurement::new(self.id.clone());
        for _ in 0..request.sample_count() {
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                return Err(DriverError::new(
                    &self.id,
                    DriverErrorKind::Cancelled,
                    "measurement cancelled",
                )
                .into());
            }
            measurement.samples.push(Sample {
                timestamp: Utc::now(),
                channels: BTreeMap::from([("watts".to_string(), power)]),
            });
            self.config.mode.delay(period).await;
        }
        Ok(measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_peaks_at_configured_wavelength() {
        let detector = MockDetector::new("s401c");
        let request = MeasureRequest {
            sample_rate: 2.0,
            sample_time: 1.0,
        };

        let mut p = Parameters::new();
        p.insert("wavelength".into(), json!(1000.0));
        detector.set_parameters(&p).await.unwrap();
        let at_peak = detector
            .measure(&request, &CancellationToken::new())
            .await
            .unwrap();

        p.insert("wavelength".into(), json!(500.0));
        detector.set_parameters(&p).await.unwrap();
        let off_peak = detector
            .measure(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(at_peak.samples.len(), 2);
        assert!(at_peak.samples[0].channels["watts"] > off_peak.samples[0].channels["watts"]);
    }

    #[tokio::test]
    async fn vanishing_sample_rate_is_rejected() {
        let detector = MockDetector::new("s401c");
        let request = MeasureRequest {
            sample_rate: f64::MIN_POSITIVE,
            sample_time: 1.0,
        };
        let err = detector
            .measure(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        let driver = err.downcast_ref::<DriverError>().unwrap();
        assert_eq!(driver.kind, DriverErrorKind::InvalidParameter);
    }
}
