//! Mock neutral-density filter wheel.
//!
//! The real wheel is driven through a blocking serial library, so this mock
//! implements [`SyncInstrument`] and reaches the state machine through the
//! sync adapter chosen at registration.

use crate::common::params::{get_u64, reject_unknown};
use crate::common::{FaultConfig, FaultInjector, MockMode};
use anyhow::{bail, Result};
use cal_core::driver::{InstrumentComponents, InstrumentFactory};
use cal_core::{ParameterQuery, Parameters, SyncInstrument};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Configuration for the mock filter wheel
#[derive(Debug, Clone, Deserialize)]
pub struct MockNdfWheelConfig {
    /// Number of filter slots (default: 6)
    #[serde(default = "default_positions")]
    pub positions: u64,
    /// Timing mode
    #[serde(default)]
    pub mode: MockMode,
    /// Fault injection
    #[serde(default)]
    pub faults: FaultConfig,
}

fn default_positions() -> u64 {
    6
}

impl Default for MockNdfWheelConfig {
    fn default() -> Self {
        Self {
            positions: default_positions(),
            mode: MockMode::Instant,
            faults: FaultConfig::default(),
        }
    }
}

/// Factory for [`MockNdfWheel`] (`type = "mock_ndf"`).
pub struct MockNdfWheelFactory;

impl InstrumentFactory for MockNdfWheelFactory {
    fn driver_type(&self) -> &'static str {
        "mock_ndf"
    }

    fn name(&self) -> &'static str {
        "Mock NDF Filter Wheel"
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockNdfWheelConfig = config.clone().try_into()?;
        if cfg.positions == 0 {
            bail!("positions must be at least 1");
        }
        Ok(())
    }

    fn build(
        &self,
        id: String,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<InstrumentComponents>> {
        Box::pin(async move {
            let cfg: MockNdfWheelConfig = config.try_into()?;
            Ok(InstrumentComponents::from_sync(MockNdfWheel::with_config(id, cfg)))
        })
    }
}

/// Simulated filter wheel with a blocking API.
pub struct MockNdfWheel {
    id: String,
    config: MockNdfWheelConfig,
    position: u64,
    opened: bool,
    faults: FaultInjector,
}

impl MockNdfWheel {
    /// Six-slot wheel at position 1.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, MockNdfWheelConfig::default())
    }

    /// Wheel from a config table.
    pub fn with_config(id: impl Into<String>, config: MockNdfWheelConfig) -> Self {
        let id = id.into();
        Self {
            faults: FaultInjector::new(id.clone(), config.faults.clone()),
            id,
            config,
            position: 1,
            opened: false,
        }
    }
}

impl SyncInstrument for MockNdfWheel {
    fn open(&mut self) -> Result<()> {
        self.faults.check("open")?;
        self.opened = true;
        Ok(())
    }

    fn get_parameters(&mut self, query: &ParameterQuery) -> Result<Parameters> {
        self.faults.check("get_parameters")?;
        let mut p = Parameters::new();
        p.insert("position".into(), json!(self.position));
        Ok(query.select(&p))
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<()> {
        self.faults.check("set_parameters")?;
        reject_unknown(params, &["position"], &self.id)?;
        if let Some(pos) = get_u64(params, "position")? {
            if !(1..=self.config.positions).contains(&pos) {
                bail!(
                    "{}: position {} out of range 1-{}",
                    self.id,
                    pos,
                    self.config.positions
                );
            }
            let slots = pos.abs_diff(self.position);
            self.config
                .mode
                .delay_blocking(Duration::from_millis(100 * slots));
            self.position = pos;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cal_core::Instrument;

    #[tokio::test]
    async fn wheel_is_usable_through_the_sync_adapter() {
        let components = MockNdfWheelFactory
            .build("ndf".into(), toml::Value::Table(Default::default()))
            .await
            .unwrap();
        let wheel = components.instrument;
        wheel.open().unwrap();

        let mut p = Parameters::new();
        p.insert("position".into(), json!(4));
        wheel.set_parameters(&p).await.unwrap();

        let read = wheel.get_parameters(&ParameterQuery::All).await.unwrap();
        assert_eq!(read["position"], json!(4));
    }

    #[test]
    fn position_outside_wheel_is_rejected() {
        let mut wheel = MockNdfWheel::new("ndf");
        let mut p = Parameters::new();
        p.insert("position".into(), json!(9));
        assert!(wheel.set_parameters(&p).is_err());
        p.insert("position".into(), json!(0));
        assert!(wheel.set_parameters(&p).is_err());
    }
}
