//! Fault injection for mock instruments.
//!
//! Lets tests drive the state machine down its error path without real
//! hardware: "fail the third `set_parameters`", "lose the link".

use cal_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;

/// Fail an operation once it has succeeded `count` times.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FailAfter {
    /// Operation name (`open`, `get_parameters`, `set_parameters`, `measure`)
    pub operation: String,
    /// Successful calls allowed before failures start
    pub count: u32,
}

/// Serializable fault configuration, embedded in mock driver configs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FaultConfig {
    /// Fail an operation after N successes
    #[serde(default)]
    pub fail_after: Option<FailAfter>,
    /// Every operation fails with a communication error
    #[serde(default)]
    pub communication_loss: bool,
}

/// Runtime fault checker shared by a mock instrument's operations.
#[derive(Debug)]
pub struct FaultInjector {
    instrument: String,
    config: FaultConfig,
    counts: Mutex<HashMap<String, u32>>,
}

impl FaultInjector {
    /// Injector with the given configuration.
    pub fn new(instrument: impl Into<String>, config: FaultConfig) -> Self {
        Self {
            instrument: instrument.into(),
            config,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Injector that never fails.
    pub fn none(instrument: impl Into<String>) -> Self {
        Self::new(instrument, FaultConfig::default())
    }

    /// Injector failing `operation` after `count` successes.
    pub fn fail_after(instrument: impl Into<String>, operation: &str, count: u32) -> Self {
        Self::new(
            instrument,
            FaultConfig {
                fail_after: Some(FailAfter {
                    operation: operation.to_string(),
                    count,
                }),
                communication_loss: false,
            },
        )
    }

    /// Check whether `operation` should fail now.
    pub fn check(&self, operation: &str) -> Result<(), DriverError> {
        if self.config.communication_loss {
            return Err(DriverError::new(
                &self.instrument,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }

        if let Some(rule) = &self.config.fail_after {
            if rule.operation == operation {
                let mut counts = self.counts.lock();
                let seen = counts.entry(operation.to_string()).or_insert(0);
                if *seen >= rule.count {
                    return Err(DriverError::new(
                        &self.instrument,
                        DriverErrorKind::Hardware,
                        format!("Injected failure after {} '{}' calls", rule.count, operation),
                    ));
                }
                *seen += 1;
            }
        }

        Ok(())
    }
}
