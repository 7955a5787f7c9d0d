//! Instrument registry for runtime hardware management.
//!
//! The registry maps instrument ids (`cs260`, `sr830`, `ndf`, …) to the
//! capability objects the state machine uses. Blocking drivers are wrapped in
//! the sync adapter here, once, so the rest of the system only ever sees
//! `Arc<dyn Instrument>`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 InstrumentRegistry                   │
//! │  factories: driver_type → Box<dyn InstrumentFactory> │
//! │  instruments: id → InstrumentComponents              │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::config::InstrumentDefinition;
use anyhow::{anyhow, Context, Result};
use cal_core::driver::{InstrumentComponents, InstrumentFactory};
use cal_core::error::CalError;
use cal_core::{Instrument, Measurable, ParameterQuery, Parameters, SyncInstrument};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Summary of a registered instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentInfo {
    /// Instrument id
    pub id: String,
    /// Driver type it was built from, if built by a factory
    pub driver_type: Option<String>,
    /// Whether it can measure
    pub measurable: bool,
}

struct RegisteredInstrument {
    driver_type: Option<String>,
    components: InstrumentComponents,
}

/// Central registry of bench instruments.
#[derive(Default)]
pub struct InstrumentRegistry {
    factories: DashMap<String, Arc<dyn InstrumentFactory>>,
    instruments: DashMap<String, RegisteredInstrument>,
}

impl InstrumentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a driver type available to [`InstrumentRegistry::register_definition`].
    pub fn register_factory(&self, factory: Box<dyn InstrumentFactory>) {
        let driver_type = factory.driver_type().to_string();
        tracing::debug!(driver_type = %driver_type, name = factory.name(), "registered instrument factory");
        self.factories.insert(driver_type, Arc::from(factory));
    }

    /// Whether a factory exists for `driver_type`.
    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Register already-built components under `id`.
    pub fn register(&self, id: impl Into<String>, components: InstrumentComponents) -> Result<(), CalError> {
        self.insert(id.into(), None, components)
    }

    /// Register an async instrument without measurement capability.
    pub fn register_instrument(
        &self,
        id: impl Into<String>,
        instrument: Arc<dyn Instrument>,
    ) -> Result<(), CalError> {
        self.register(id, InstrumentComponents::new(instrument))
    }

    /// Register an instrument that can also measure.
    pub fn register_measurable<T>(&self, id: impl Into<String>, instrument: Arc<T>) -> Result<(), CalError>
    where
        T: Instrument + Measurable + 'static,
    {
        let components = InstrumentComponents::new(instrument.clone()).with_measurable(instrument);
        self.register(id, components)
    }

    /// Register a blocking driver behind the sync adapter.
    pub fn register_sync<T: SyncInstrument + 'static>(
        &self,
        id: impl Into<String>,
        driver: T,
    ) -> Result<(), CalError> {
        self.register(id, InstrumentComponents::from_sync(driver))
    }

    /// Build and register an instrument from a config entry.
    ///
    /// Disabled entries are skipped.
    pub async fn register_definition(&self, definition: &InstrumentDefinition) -> Result<()> {
        if !definition.enabled {
            tracing::info!(instrument = %definition.id, "instrument disabled, skipping");
            return Ok(());
        }
        if self.instruments.contains_key(&definition.id) {
            return Err(CalError::DuplicateInstrument(definition.id.clone()).into());
        }

        let factory = self
            .factories
            .get(&definition.r#type)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| {
                anyhow!(
                    "No driver factory for type '{}' (instrument '{}')",
                    definition.r#type,
                    definition.id
                )
            })?;

        factory.validate(&definition.config).with_context(|| {
            format!(
                "Configuration validation failed for instrument '{}' ({})",
                definition.id,
                factory.name()
            )
        })?;

        let components = factory
            .build(definition.id.clone(), definition.config.clone())
            .await
            .with_context(|| format!("Failed to build instrument '{}'", definition.id))?;

        self.insert(definition.id.clone(), Some(definition.r#type.clone()), components)?;
        tracing::info!(instrument = %definition.id, driver_type = %definition.r#type, "instrument registered");
        Ok(())
    }

    fn insert(
        &self,
        id: String,
        driver_type: Option<String>,
        components: InstrumentComponents,
    ) -> Result<(), CalError> {
        use dashmap::mapref::entry::Entry;
        match self.instruments.entry(id) {
            Entry::Occupied(e) => Err(CalError::DuplicateInstrument(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(RegisteredInstrument {
                    driver_type,
                    components,
                });
                Ok(())
            }
        }
    }

    /// Remove an instrument. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        self.instruments.remove(id).is_some()
    }

    /// Parameter access for `id`.
    pub fn get_instrument(&self, id: &str) -> Option<Arc<dyn Instrument>> {
        self.instruments
            .get(id)
            .map(|r| Arc::clone(&r.components.instrument))
    }

    /// Parameter access for `id`, or an error naming the missing instrument.
    pub fn require(&self, id: &str) -> Result<Arc<dyn Instrument>, CalError> {
        self.get_instrument(id)
            .ok_or_else(|| CalError::UnknownInstrument(id.to_string()))
    }

    /// Measurement capability for `id`, if it has one.
    pub fn get_measurable(&self, id: &str) -> Option<Arc<dyn Measurable>> {
        self.instruments
            .get(id)
            .and_then(|r| r.components.measurable.clone())
    }

    /// Check if an instrument is registered
    pub fn contains(&self, id: &str) -> bool {
        self.instruments.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instruments.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Summaries of every instrument, sorted by id.
    pub fn list(&self) -> Vec<InstrumentInfo> {
        let mut infos: Vec<InstrumentInfo> = self
            .instruments
            .iter()
            .map(|r| InstrumentInfo {
                id: r.key().clone(),
                driver_type: r.driver_type.clone(),
                measurable: r.components.measurable.is_some(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Get count of registered instruments
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    fn handles(&self) -> Vec<(String, Arc<dyn Instrument>)> {
        let mut handles: Vec<_> = self
            .instruments
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(&r.components.instrument)))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    /// Open every instrument, stopping at the first failure.
    pub fn open_all(&self) -> Result<()> {
        for (id, instrument) in self.handles() {
            instrument
                .open()
                .with_context(|| format!("Failed to open instrument '{}'", id))?;
        }
        Ok(())
    }

    /// Full parameter snapshot of every instrument.
    pub async fn snapshot_all(&self) -> Result<BTreeMap<String, Parameters>> {
        let mut snapshot = BTreeMap::new();
        for (id, instrument) in self.handles() {
            let params = instrument
                .get_parameters(&ParameterQuery::All)
                .await
                .with_context(|| format!("Failed to read parameters of '{}'", id))?;
            snapshot.insert(id, params);
        }
        Ok(snapshot)
    }

    /// Abort every instrument. Failures are logged and returned, not fatal.
    pub async fn abort_all(&self) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        for (id, instrument) in self.handles() {
            if let Err(e) = instrument.abort().await {
                tracing::error!(instrument = %id, error = %e, "abort failed");
                failures.push((id, e));
            }
        }
        failures
    }
}

/// Registry with every mock factory registered.
pub fn registry_with_mock_factories() -> InstrumentRegistry {
    let registry = InstrumentRegistry::new();
    for factory in cal_driver_mock::factories() {
        registry.register_factory(factory);
    }
    registry
}

/// Build a registry from config entries using the mock factories.
pub async fn create_registry_from_definitions(
    definitions: &[InstrumentDefinition],
) -> Result<InstrumentRegistry> {
    let registry = registry_with_mock_factories();
    for definition in definitions {
        registry.register_definition(definition).await?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cal_driver_mock::{MockLockin, MockMonochromator, MockNdfWheel};
    use serde_json::json;

    fn definition(id: &str, ty: &str, config: &str) -> InstrumentDefinition {
        InstrumentDefinition {
            id: id.into(),
            r#type: ty.into(),
            enabled: true,
            config: toml::from_str(config).unwrap(),
        }
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = InstrumentRegistry::new();
        registry
            .register_instrument("cs260", Arc::new(MockMonochromator::new("cs260")))
            .unwrap();
        let err = registry
            .register_instrument("cs260", Arc::new(MockMonochromator::new("cs260")))
            .unwrap_err();
        assert!(matches!(err, CalError::DuplicateInstrument(id) if id == "cs260"));
    }

    #[tokio::test]
    async fn measurable_and_sync_registration() {
        let registry = InstrumentRegistry::new();
        registry
            .register_measurable("sr830", Arc::new(MockLockin::new("sr830")))
            .unwrap();
        registry.register_sync("ndf", MockNdfWheel::new("ndf")).unwrap();

        assert!(registry.get_measurable("sr830").is_some());
        assert!(registry.get_measurable("ndf").is_none());
        assert_eq!(registry.ids(), vec!["ndf".to_string(), "sr830".to_string()]);

        registry.open_all().unwrap();
        let snapshot = registry.snapshot_all().await.unwrap();
        assert_eq!(snapshot["ndf"]["position"], json!(1));
    }

    #[tokio::test]
    async fn definitions_build_through_factories() {
        let registry = create_registry_from_definitions(&[
            definition("cs260", "mock_cs260", "wavelength = 0.7"),
            definition("sr830", "mock_lockin", "model = \"SR830\"\nseed = 1"),
            definition("ndf", "mock_ndf", "positions = 8"),
        ])
        .await
        .unwrap();

        assert_eq!(registry.len(), 3);
        let info = registry.list();
        assert_eq!(info[0].driver_type.as_deref(), Some("mock_cs260"));
        assert!(info.iter().any(|i| i.id == "sr830" && i.measurable));
    }

    #[tokio::test]
    async fn unknown_driver_type_fails() {
        let err = create_registry_from_definitions(&[definition("x", "mock_laser", "")])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("mock_laser"));
    }

    #[tokio::test]
    async fn disabled_definition_is_skipped() {
        let mut def = definition("ndf", "mock_ndf", "");
        def.enabled = false;
        let registry = create_registry_from_definitions(&[def]).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn require_reports_missing_instrument() {
        let registry = InstrumentRegistry::new();
        assert!(matches!(
            registry.require("cs260"),
            Err(CalError::UnknownInstrument(_))
        ));
    }
}
