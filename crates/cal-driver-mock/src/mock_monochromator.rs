//! Mock CS260 monochromator.
//!
//! Simulates the bench monochromator with:
//! - Wavelength in micrometres
//! - Three gratings and four order-sort-filter positions (4 = no filter)
//! - A shutter that [`Instrument::abort`] always closes
//!
//! Every accepted `set_parameters` call is recorded so tests can assert on the
//! exact command stream the state machine produced.

use crate::common::params::{get_f64, get_str, get_u64, reject_unknown};
use crate::common::{FaultConfig, FaultInjector, MockMode};
use anyhow::{bail, Result};
use async_trait::async_trait;
use cal_core::driver::{InstrumentComponents, InstrumentFactory};
use cal_core::{Instrument, ParameterQuery, Parameters};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const PARAMS: &[&str] = &["wavelength", "grating", "order_sort_filter", "shutter"];
const GRATINGS: u64 = 3;
const FILTERS: u64 = 4;

/// Configuration for the mock monochromator
#[derive(Debug, Clone, Deserialize)]
pub struct MockMonochromatorConfig {
    /// Initial wavelength in µm (default: 0.5)
    #[serde(default = "default_wavelength")]
    pub wavelength: f64,
    /// Timing mode
    #[serde(default)]
    pub mode: MockMode,
    /// Fault injection
    #[serde(default)]
    pub faults: FaultConfig,
}

fn default_wavelength() -> f64 {
    0.5
}

impl Default for MockMonochromatorConfig {
    fn default() -> Self {
        Self {
            wavelength: default_wavelength(),
            mode: MockMode::Instant,
            faults: FaultConfig::default(),
        }
    }
}

/// Factory for [`MockMonochromator`] (`type = "mock_cs260"`).
pub struct MockMonochromatorFactory;

impl InstrumentFactory for MockMonochromatorFactory {
    fn driver_type(&self) -> &'static str {
        "mock_cs260"
    }

    fn name(&self) -> &'static str {
        "Mock CS260 Monochromator"
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: MockMonochromatorConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(
        &self,
        id: String,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<InstrumentComponents>> {
        Box::pin(async move {
            let cfg: MockMonochromatorConfig = config.try_into()?;
            let mono = MockMonochromator::with_config(id, cfg);
            Ok(InstrumentComponents::new(Arc::new(mono)))
        })
    }
}

#[derive(Debug, Clone)]
struct MonoState {
    wavelength: f64,
    grating: u64,
    order_sort_filter: u64,
    shutter_open: bool,
}

/// Simulated CS260 monochromator.
pub struct MockMonochromator {
    id: String,
    mode: MockMode,
    state: RwLock<MonoState>,
    faults: FaultInjector,
    opened: AtomicBool,
    history: Mutex<Vec<Parameters>>,
    aborts: AtomicUsize,
}

impl MockMonochromator {
    /// Monochromator at 0.5 µm, grating 1, OSF 1, shutter closed.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, MockMonochromatorConfig::default())
    }

    /// Monochromator from a config table.
    pub fn with_config(id: impl Into<String>, config: MockMonochromatorConfig) -> Self {
        let id = id.into();
        Self {
            faults: FaultInjector::new(id.clone(), config.faults),
            id,
            mode: config.mode,
            state: RwLock::new(MonoState {
                wavelength: config.wavelength,
                grating: 1,
                order_sort_filter: 1,
                shutter_open: false,
            }),
            opened: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Replace the fault injector.
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    /// Every accepted `set_parameters` payload, oldest first.
    pub fn set_history(&self) -> Vec<Parameters> {
        self.history.lock().clone()
    }

    /// Number of `abort` calls seen.
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Whether `open` has been called.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Current shutter state.
    pub async fn shutter_open(&self) -> bool {
        self.state.read().await.shutter_open
    }

    fn snapshot(state: &MonoState) -> Parameters {
        let mut p = Parameters::new();
        p.insert("wavelength".into(), json!(state.wavelength));
        p.insert("grating".into(), json!(state.grating));
        p.insert("order_sort_filter".into(), json!(state.order_sort_filter));
        p.insert(
            "shutter".into(),
            json!(if state.shutter_open { "open" } else { "closed" }),
        );
        p
    }
}

#[async_trait]
impl Instrument for MockMonochromator {
    fn open(&self) -> Result<()> {
        self.faults.check("open")?;
        self.opened.store(true, Ordering::SeqCst);
        tracing::debug!(instrument = %self.id, "monochromator opened");
        Ok(())
    }

    async fn get_parameters(&self, query: &ParameterQuery) -> Result<Parameters> {
        self.faults.check("get_parameters")?;
        let state = self.state.read().await;
        Ok(query.select(&Self::snapshot(&state)))
    }

    async fn set_parameters(&self, params: &Parameters) -> Result<()> {
        self.faults.check("set_parameters")?;
        reject_unknown(params, PARAMS, &self.id)?;

        let wavelength = get_f64(params, "wavelength")?;
        let grating = get_u64(params, "grating")?;
        let osf = get_u64(params, "order_sort_filter")?;
        let shutter = get_str(params, "shutter")?
            .map(|s| match s.to_ascii_lowercase().as_str() {
                "open" => Ok(true),
                "closed" => Ok(false),
                other => bail!("{}: invalid shutter state '{}'", self.id, other),
            })
            .transpose()?;

        if let Some(w) = wavelength {
            if !w.is_finite() || w < 0.0 {
                bail!("{}: wavelength {} out of range", self.id, w);
            }
        }
        if let Some(g) = grating {
            if !(1..=GRATINGS).contains(&g) {
                bail!("{}: grating {} out of range 1-{}", self.id, g, GRATINGS);
            }
        }
        if let Some(f) = osf {
            if !(1..=FILTERS).contains(&f) {
                bail!("{}: order sort filter {} out of range 1-{}", self.id, f, FILTERS);
            }
        }

        if grating.is_some() {
            self.mode.delay(Duration::from_millis(200)).await;
        }
        if wavelength.is_some() {
            self.mode.delay(Duration::from_millis(50)).await;
        }

        let mut state = self.state.write().await;
        if let Some(w) = wavelength {
            state.wavelength = w;
        }
        if let Some(g) = grating {
            state.grating = g;
        }
        if let Some(f) = osf {
            state.order_sort_filter = f;
        }
        if let Some(open) = shutter {
            state.shutter_open = open;
        }
        drop(state);

        self.history.lock().push(params.clone());
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        // Shutter closes regardless of injected faults.
        self.state.write().await.shutter_open = false;
        self.aborts.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(instrument = %self.id, "monochromator aborted, shutter closed");
        Ok(())
    }
}
