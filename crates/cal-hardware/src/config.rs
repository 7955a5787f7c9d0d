//! Instrument entries as they appear in the bench configuration file.

use serde::{Deserialize, Serialize};

/// One `[[instruments]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier (`cs260`, `sr830`, …)
    pub id: String,
    /// Driver type handled by a registered factory (e.g. `mock_cs260`)
    pub r#type: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration table
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}
