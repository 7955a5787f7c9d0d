//! Mock SR510/SR830 lock-in amplifier.
//!
//! Measurement follows the bench procedure: wait `settle_multiplier` time
//! constants for the output filter to settle, then read `sample_rate ×
//! sample_time` points in a tight loop that yields to the scheduler between
//! reads. Both phases stop as soon as the cancellation token fires.

use crate::common::params::{get_f64, reject_unknown};
use crate::common::mode::{checked_duration, sample_period};
use crate::common::{FaultConfig, FaultInjector, MockMode};
use anyhow::{bail, Result};
use async_trait::async_trait;
use cal_core::driver::{InstrumentComponents, InstrumentFactory};
use cal_core::error::{DriverError, DriverErrorKind};
use cal_core::{Instrument, MeasureRequest, Measurable, Measurement, ParameterQuery, Parameters, Sample};
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const PARAMS: &[&str] = &["sensitivity", "time_constant", "sample_rate"];

/// Time constants the output filter needs before readings are trusted.
pub const DEFAULT_SETTLE_MULTIPLIER: f64 = 5.0;

/// Configuration for the mock lock-in
#[derive(Debug, Clone, Deserialize)]
pub struct MockLockinConfig {
    /// Model string reported as metadata (`SR510`, `SR830`)
    #[serde(default = "default_model")]
    pub model: String,
    /// Simulated signal amplitude in volts
    #[serde(default = "default_signal")]
    pub signal: f64,
    /// Relative noise amplitude
    #[serde(default = "default_noise")]
    pub noise: f64,
    /// Settling time in time constants
    #[serde(default = "default_settle")]
    pub settle_multiplier: f64,
    /// RNG seed for reproducible noise
    #[serde(default)]
    pub seed: Option<u64>,
    /// Timing mode
    #[serde(default)]
    pub mode: MockMode,
    /// Fault injection
    #[serde(default)]
    pub faults: FaultConfig,
}

fn default_model() -> String {
    "SR830".to_string()
}

fn default_signal() -> f64 {
    1.0e-3
}

fn default_noise() -> f64 {
    0.01
}

fn default_settle() -> f64 {
    DEFAULT_SETTLE_MULTIPLIER
}

impl Default for MockLockinConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            signal: default_signal(),
            noise: default_noise(),
            settle_multiplier: default_settle(),
            seed: None,
            mode: MockMode::Instant,
            faults: FaultConfig::default(),
        }
    }
}

/// Factory for [`MockLockin`] (`type = "mock_lockin"`).
pub struct MockLockinFactory;

impl InstrumentFactory for MockLockinFactory {
    fn driver_type(&self) -> &'static str {
        "mock_lockin"
    }

    fn name(&self) -> &'static str {
        "Mock SR510/SR830 Lock-In Amplifier"
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockLockinConfig = config.clone().try_into()?;
        if cfg.settle_multiplier < 0.0 {
            bail!("settle_multiplier must be non-negative");
        }
        Ok(())
    }

    fn build(
        &self,
        id: String,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<InstrumentComponents>> {
        Box::pin(async move {
            let cfg: MockLockinConfig = config.try_into()?;
            let lockin = Arc::new(MockLockin::with_config(id, cfg));
            Ok(InstrumentComponents::new(lockin.clone()).with_measurable(lockin))
        })
    }
}

#[derive(Debug, Clone)]
struct LockinState {
    sensitivity: f64,
    time_constant: f64,
    sample_rate: f64,
}

/// Simulated lock-in amplifier.
pub struct MockLockin {
    id: String,
    config: MockLockinConfig,
    state: RwLock<LockinState>,
    faults: FaultInjector,
    rng: Mutex<StdRng>,
}

impl MockLockin {
    /// Lock-in with default settings.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, MockLockinConfig::default())
    }

    /// Lock-in from a config table.
    pub fn with_config(id: impl Into<String>, config: MockLockinConfig) -> Self {
        let id = id.into();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            faults: FaultInjector::new(id.clone(), config.faults.clone()),
            id,
            config,
            state: RwLock::new(LockinState {
                sensitivity: 1.0,
                time_constant: 0.1,
                sample_rate: 10.0,
            }),
            rng: Mutex::new(rng),
        }
    }

    /// Replace the fault injector.
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    fn cancelled(&self) -> anyhow::Error {
        DriverError::new(&self.id, DriverErrorKind::Cancelled, "measurement cancelled").into()
    }

    fn read_point(&self, sensitivity: f64) -> Sample {
        let mut rng = self.rng.lock();
        let jitter: f64 = rng.gen_range(-1.0..1.0);
        let quad: f64 = rng.gen_range(-1.0..1.0);
        let x = (self.config.signal * (1.0 + self.config.noise * jitter)).min(sensitivity);
        let y = self.config.signal * self.config.noise * quad;
        Sample {
            timestamp: Utc::now(),
            channels: BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)]),
        }
    }
}

#[async_trait]
impl Instrument for MockLockin {
    fn open(&self) -> Result<()> {
        self.faults.check("open")?;
        tracing::debug!(instrument = %self.id, model = %self.config.model, "lock-in opened");
        Ok(())
    }

    async fn get_parameters(&self, query: &ParameterQuery) -> Result<Parameters> {
        self.faults.check("get_parameters")?;
        let state = self.state.read().await;
        let mut p = Parameters::new();
        p.insert("sensitivity".into(), json!(state.sensitivity));
        p.insert("time_constant".into(), json!(state.time_constant));
        p.insert("sample_rate".into(), json!(state.sample_rate));
        Ok(query.select(&p))
    }

    async fn set_parameters(&self, params: &Parameters) -> Result<()> {
        self.faults.check("set_parameters")?;
        reject_unknown(params, PARAMS, &self.id)?;

        let sensitivity = get_f64(params, "sensitivity")?;
        let time_constant = get_f64(params, "time_constant")?;
        let sample_rate = get_f64(params, "sample_rate")?;
        for (name, value) in [
            ("sensitivity", sensitivity),
            ("time_constant", time_constant),
            ("sample_rate", sample_rate),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    bail!("{}: {} must be positive, got {}", self.id, name, v);
                }
            }
        }

        self.config.mode.delay(Duration::from_millis(5)).await;
        let mut state = self.state.write().await;
        if let Some(v) = sensitivity {
            state.sensitivity = v;
        }
        if let Some(v) = time_constant {
            state.time_constant = v;
        }
        if let Some(v) = sample_rate {
            state.sample_rate = v;
        }
        Ok(())
    }
}

#[async_trait]
impl Measurable for MockLockin {
    async fn measure(
        &self,
        request: &MeasureRequest,
        cancel: &CancellationToken,
    ) -> Result<Measurement> {
        self.faults.check("measure")?;
        let (sensitivity, time_constant) = {
            let state = self.state.read().await;
            (state.sensitivity, state.time_constant)
        };

        let settle = checked_duration(
            &self.id,
            "settle time",
            self.config.settle_multiplier * time_constant,
        )?;
        tracing::debug!(instrument = %self.id, settle_ms = settle.as_millis() as u64, "waiting for lock-in to settle");
        tokio::select! {
            _ = cancel.cancelled() => return Err(self.cancelled()),
            _ = tokio::time::sleep(settle) => {}
        }

        let count = request.sample_count();
        let period = sample_period(&self.id, request.sample_rate)?;
        let mut measurement = Measurement::new(self.id.clone());
        measurement.samples.reserve(count);
        for _ in 0..count {
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            measurement.samples.push(self.read_point(sensitivity));
            self.config.mode.delay(period).await;
        }

        Ok(measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_lockin() -> MockLockin {
        MockLockin::with_config(
            "sr830",
            MockLockinConfig {
                seed: Some(7),
                ..Default::default()
            },
        )
    }

    async fn set_time_constant(lockin: &MockLockin, tc: f64) {
        let mut p = Parameters::new();
        p.insert("time_constant".into(), json!(tc));
        lockin.set_parameters(&p).await.unwrap();
    }

    #[tokio::test]
    async fn measure_returns_requested_sample_count() {
        let lockin = quick_lockin();
        set_time_constant(&lockin, 0.001).await;
        let request = MeasureRequest {
            sample_rate: 20.0,
            sample_time: 0.5,
        };
        let m = lockin
            .measure(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(m.samples.len(), 10);
        assert!(m.samples.iter().all(|s| s.channels.contains_key("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn measure_waits_five_time_constants() {
        let lockin = quick_lockin();
        set_time_constant(&lockin, 2.0).await;
        let request = MeasureRequest {
            sample_rate: 1.0,
            sample_time: 1.0,
        };
        let start = tokio::time::Instant::now();
        lockin
            .measure(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_interrupts_settling() {
        let lockin = quick_lockin();
        set_time_constant(&lockin, 100.0).await;
        let token = CancellationToken::new();
        token.cancel();
        let request = MeasureRequest {
            sample_rate: 1.0,
            sample_time: 1.0,
        };
        let err = lockin.measure(&request, &token).await.unwrap_err();
        let driver = err.downcast_ref::<DriverError>().unwrap();
        assert_eq!(driver.kind, DriverErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn unrepresentable_timing_is_an_error() {
        let lockin = quick_lockin();
        set_time_constant(&lockin, 1e300).await;
        let request = MeasureRequest {
            sample_rate: 1.0,
            sample_time: 1.0,
        };
        let err = lockin
            .measure(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        let driver = err.downcast_ref::<DriverError>().unwrap();
        assert_eq!(driver.kind, DriverErrorKind::InvalidParameter);

        set_time_constant(&lockin, 0.001).await;
        let tiny_rate = MeasureRequest {
            sample_rate: f64::MIN_POSITIVE,
            sample_time: 1.0,
        };
        assert!(lockin
            .measure(&tiny_rate, &CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn non_positive_sensitivity_is_rejected() {
        let lockin = quick_lockin();
        let mut p = Parameters::new();
        p.insert("sensitivity".into(), json!(0.0));
        assert!(lockin.set_parameters(&p).await.is_err());
    }
}
