//! Instrument facade traits.
//!
//! The state machine talks to every bench instrument through [`Instrument`]:
//! read a parameter snapshot, write a parameter map, and (for the few that can)
//! abort. Instruments that acquire data also implement [`Measurable`].
//!
//! Drivers with a blocking API implement [`SyncInstrument`] instead and are
//! wrapped once, at registration, in a [`SyncAdapter`]. Callers never check
//! which flavour they hold.
//!
//! # Example
//!
//! ```rust,ignore
//! let current = mono.get_parameters(&ParameterQuery::All).await?;
//! let changes = diff(&current, &requested);
//! if !changes.is_empty() {
//!     mono.set_parameters(&changes).await?;
//! }
//! ```

use crate::data::{MeasureRequest, Measurement};
use crate::parameters::{ParameterQuery, Parameters};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Uniform parameter access for a bench instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Open the connection. Synchronous by contract.
    fn open(&self) -> Result<()>;

    /// Read the requested parameters.
    async fn get_parameters(&self, query: &ParameterQuery) -> Result<Parameters>;

    /// Write every entry of `params`.
    async fn set_parameters(&self, params: &Parameters) -> Result<()>;

    /// Bring the instrument to a safe state after an abort.
    ///
    /// The default does nothing; the monochromator closes its shutter.
    async fn abort(&self) -> Result<()> {
        Ok(())
    }
}

/// Instruments that acquire samples (lock-ins, detectors).
#[async_trait]
pub trait Measurable: Send + Sync {
    /// Acquire samples according to `request`.
    ///
    /// Implementations must return promptly with a `Cancelled` driver error
    /// once `cancel` fires.
    async fn measure(
        &self,
        request: &MeasureRequest,
        cancel: &CancellationToken,
    ) -> Result<Measurement>;
}

/// Blocking counterpart of [`Instrument`].
pub trait SyncInstrument: Send {
    /// Open the connection.
    fn open(&mut self) -> Result<()>;

    /// Read the requested parameters.
    fn get_parameters(&mut self, query: &ParameterQuery) -> Result<Parameters>;

    /// Write every entry of `params`.
    fn set_parameters(&mut self, params: &Parameters) -> Result<()>;

    /// Bring the instrument to a safe state after an abort.
    fn abort(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Exposes a [`SyncInstrument`] as an [`Instrument`].
///
/// Each call runs on the blocking pool so the state machine's executor is
/// never stalled by device I/O.
pub struct SyncAdapter<T> {
    inner: Arc<Mutex<T>>,
}

impl<T: SyncInstrument + 'static> SyncAdapter<T> {
    /// Wrap a blocking driver.
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }
}

#[async_trait]
impl<T: SyncInstrument + 'static> Instrument for SyncAdapter<T> {
    fn open(&self) -> Result<()> {
        self.inner.lock().open()
    }

    async fn get_parameters(&self, query: &ParameterQuery) -> Result<Parameters> {
        let inner = Arc::clone(&self.inner);
        let query = query.clone();
        tokio::task::spawn_blocking(move || inner.lock().get_parameters(&query)).await?
    }

    async fn set_parameters(&self, params: &Parameters) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let params = params.clone();
        tokio::task::spawn_blocking(move || inner.lock().set_parameters(&params)).await?
    }

    async fn abort(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.lock().abort()).await?
    }
}
