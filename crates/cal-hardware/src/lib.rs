//! Hardware management for the spectral calibration bench.
//!
//! [`InstrumentRegistry`] owns every instrument the state machine drives and
//! builds them from `[[instruments]]` config entries through registered
//! factories.

pub mod config;
pub mod registry;

pub use config::InstrumentDefinition;
pub use registry::{
    create_registry_from_definitions, registry_with_mock_factories, InstrumentInfo,
    InstrumentRegistry,
};
