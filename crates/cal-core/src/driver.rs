//! Instrument factories and the component bag they produce.
//!
//! Drivers implement [`InstrumentFactory`] and are registered with the
//! instrument registry at startup. The registry looks a factory up by the
//! `type` field of an `[[instruments]]` config entry, hands it the entry's
//! `config` table, and stores the returned [`InstrumentComponents`].
//!
//! ```text
//! bench.toml [[instruments]] ──► InstrumentFactory::build() ──► InstrumentComponents
//!                                                                  │
//!                                               InstrumentRegistry ◄┘
//! ```

use crate::capabilities::{Instrument, Measurable, SyncAdapter, SyncInstrument};
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Capabilities produced by a driver.
///
/// Every instrument has parameter access. Measuring instruments also expose
/// a [`Measurable`]; usually the same object behind two trait objects.
#[derive(Clone)]
pub struct InstrumentComponents {
    /// Parameter access
    pub instrument: Arc<dyn Instrument>,
    /// Data acquisition, if supported
    pub measurable: Option<Arc<dyn Measurable>>,
}

impl InstrumentComponents {
    /// Components for an async instrument.
    pub fn new(instrument: Arc<dyn Instrument>) -> Self {
        Self {
            instrument,
            measurable: None,
        }
    }

    /// Components for a blocking driver, wrapped in a [`SyncAdapter`].
    pub fn from_sync<T: SyncInstrument + 'static>(driver: T) -> Self {
        Self::new(Arc::new(SyncAdapter::new(driver)))
    }

    /// Attach a measurement capability.
    pub fn with_measurable(mut self, measurable: Arc<dyn Measurable>) -> Self {
        self.measurable = Some(measurable);
        self
    }
}

/// Builds instruments of one driver type from configuration.
pub trait InstrumentFactory: Send + Sync {
    /// Value of the `type` field this factory handles, e.g. `"mock_cs260"`.
    fn driver_type(&self) -> &'static str;

    /// Human-readable driver name.
    fn name(&self) -> &'static str;

    /// Check a config table without building anything.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Instantiate the driver for instrument `id`.
    fn build(&self, id: String, config: toml::Value)
        -> BoxFuture<'static, Result<InstrumentComponents>>;
}
