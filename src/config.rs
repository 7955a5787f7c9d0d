//! Bench configuration loaded with Figment.
//!
//! Configuration is merged from:
//! 1. a TOML file (`config/bench.toml` by default)
//! 2. environment variables prefixed with `SPECTRAL_CAL_`, nested keys
//!    separated by `__` (e.g. `SPECTRAL_CAL_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use spectral_cal::config::BenchConfig;
//!
//! let config = BenchConfig::load()?;
//! config.validate()?;
//! println!("Bench: {}", config.application.name);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Result};
use cal_experiment::SpectralSettings;
use cal_hardware::{registry_with_mock_factories, InstrumentDefinition};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SPECTRAL_CAL_";

/// Top-level bench configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// State machine settings
    #[serde(default)]
    pub machine: MachineConfig,
    /// Output settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Bench name shown in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// State machine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Depth of the abort/pause channel
    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,
    /// Depth of the series/manual input channel
    #[serde(default = "default_input_capacity")]
    pub input_capacity: usize,
    /// Lock-in settling time in time constants, applied to lock-ins that do
    /// not set their own
    #[serde(default = "default_settle_multiplier")]
    pub settle_multiplier: f64,
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory that relative sequence storage paths are resolved against
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Append records to the daily JSON archive
    #[serde(default = "default_enabled")]
    pub write_json: bool,
    /// Append raw samples to per-sequence CSV files
    #[serde(default = "default_enabled")]
    pub write_csv: bool,
}

fn default_name() -> String {
    "Spectral Calibration Bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_control_capacity() -> usize {
    cal_experiment::machine::DEFAULT_CONTROL_CAPACITY
}

fn default_input_capacity() -> usize {
    cal_experiment::spectral::DEFAULT_INPUT_CAPACITY
}

fn default_settle_multiplier() -> f64 {
    cal_driver_mock::DEFAULT_SETTLE_MULTIPLIER
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_enabled() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            control_capacity: default_control_capacity(),
            input_capacity: default_input_capacity(),
            settle_multiplier: default_settle_multiplier(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            write_json: true,
            write_csv: true,
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            machine: MachineConfig::default(),
            storage: StorageConfig::default(),
            instruments: Vec::new(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Driver types whose config accepts `settle_multiplier`.
const LOCKIN_TYPES: [&str; 1] = ["mock_lockin"];

impl BenchConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            );
        }
        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            bail!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            );
        }

        if self.machine.control_capacity == 0 {
            bail!("machine.control_capacity must be at least 1");
        }
        if self.machine.input_capacity == 0 {
            bail!("machine.input_capacity must be at least 1");
        }
        if !self.machine.settle_multiplier.is_finite() || self.machine.settle_multiplier < 0.0 {
            bail!(
                "machine.settle_multiplier must be non-negative, got {}",
                self.machine.settle_multiplier
            );
        }

        let known = registry_with_mock_factories();
        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                bail!("Duplicate instrument ID: {}", instrument.id);
            }
            if !known.has_factory(&instrument.r#type) {
                bail!(
                    "Unknown instrument type '{}' for instrument '{}'",
                    instrument.r#type,
                    instrument.id
                );
            }
        }

        Ok(())
    }

    /// Enabled instruments, with the machine-wide settle multiplier filled in
    /// for lock-ins that leave it unset.
    pub fn instrument_definitions(&self) -> Vec<InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .cloned()
            .map(|mut inst| {
                if LOCKIN_TYPES.contains(&inst.r#type.as_str()) {
                    if let toml::Value::Table(table) = &mut inst.config {
                        table
                            .entry("settle_multiplier")
                            .or_insert(toml::Value::Float(self.machine.settle_multiplier));
                    }
                }
                inst
            })
            .collect()
    }

    /// Runner settings derived from `[machine]` and `[storage]`.
    pub fn spectral_settings(&self) -> SpectralSettings {
        SpectralSettings {
            write_json: self.storage.write_json,
            write_csv: self.storage.write_csv,
            input_capacity: self.machine.input_capacity,
            control_capacity: self.machine.control_capacity,
        }
    }
}
