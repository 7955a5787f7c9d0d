//! Instrument parameter maps.
//!
//! Parameters travel as `serde_json::Value` keyed by name, the same shape the
//! instruments expose through `get_parameters`/`set_parameters`. A `BTreeMap`
//! keeps iteration order stable so identical inputs serialise identically.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Name → value map for one instrument.
pub type Parameters = BTreeMap<String, Value>;

/// Relative tolerance used when comparing numeric parameter values.
///
/// Lock-in sensitivities go down to nanovolts, so an absolute epsilon would
/// swallow real changes.
pub const NUMERIC_TOLERANCE: f64 = 1e-9;

/// Which parameters a `get_parameters` call should return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterQuery {
    /// Every parameter the instrument knows.
    All,
    /// Only the named parameters.
    Names(Vec<String>),
}

impl ParameterQuery {
    /// Query for a list of names.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// Restrict a full snapshot to the names this query asks for.
    ///
    /// Unknown names are silently skipped.
    pub fn select(&self, snapshot: &Parameters) -> Parameters {
        match self {
            Self::All => snapshot.clone(),
            Self::Names(names) => names
                .iter()
                .filter_map(|n| snapshot.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
        }
    }
}

/// Compare two parameter values.
///
/// Numbers compare within [`NUMERIC_TOLERANCE`] of the larger magnitude,
/// regardless of integer/float representation, strings compare case-insensitively (instruments echo
/// `"OPEN"` for `"open"`), everything else must be equal.
pub fn values_match(current: &Value, requested: &Value) -> bool {
    match (current, requested) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => {
                a == b || (a - b).abs() <= NUMERIC_TOLERANCE * a.abs().max(b.abs())
            }
            _ => a == b,
        },
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        _ => current == requested,
    }
}

/// Keys of `requested` whose value differs from `current`.
///
/// A key missing from `current` always counts as different.
pub fn diff(current: &Parameters, requested: &Parameters) -> Parameters {
    requested
        .iter()
        .filter(|(key, value)| {
            current
                .get(*key)
                .map_or(true, |cur| !values_match(cur, value))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn identical_parameters_produce_empty_diff() {
        let current = params(&[("wavelength", json!(0.55)), ("grating", json!(1))]);
        assert!(diff(&current, &current.clone()).is_empty());
    }

    #[test]
    fn integer_and_float_compare_equal() {
        let current = params(&[("grating", json!(1.0))]);
        let requested = params(&[("grating", json!(1))]);
        assert!(diff(&current, &requested).is_empty());
    }

    #[test]
    fn nanovolt_sensitivity_changes_are_kept() {
        let current = params(&[("sensitivity", json!(1e-9))]);
        let requested = params(&[("sensitivity", json!(2e-9))]);
        assert_eq!(diff(&current, &requested), requested);

        let echoed = params(&[("sensitivity", json!(2e-9 * (1.0 + 1e-12)))]);
        assert!(diff(&echoed, &requested).is_empty());
    }

    #[test]
    fn summed_wavelengths_match_their_readback() {
        let current = params(&[("wavelength", json!(0.55))]);
        let requested = params(&[("wavelength", json!(0.5 + 0.05))]);
        assert!(diff(&current, &requested).is_empty());
        assert!(!values_match(&json!(0.0), &json!(1e-15)));
    }

    #[test]
    fn shutter_strings_compare_case_insensitively() {
        assert!(values_match(&json!("OPEN"), &json!("open")));
        assert!(!values_match(&json!("closed"), &json!("open")));
    }

    #[test]
    fn diff_keeps_only_changed_and_missing_keys() {
        let current = params(&[("wavelength", json!(0.5)), ("grating", json!(1))]);
        let requested = params(&[
            ("wavelength", json!(0.55)),
            ("grating", json!(1)),
            ("shutter", json!("open")),
        ]);
        let changed = diff(&current, &requested);
        assert_eq!(changed.len(), 2);
        assert!(changed.contains_key("wavelength"));
        assert!(changed.contains_key("shutter"));
    }

    #[test]
    fn query_select_filters_snapshot() {
        let snapshot = params(&[("a", json!(1)), ("b", json!(2))]);
        let picked = ParameterQuery::names(["b", "missing"]).select(&snapshot);
        assert_eq!(picked, params(&[("b", json!(2))]));
        assert_eq!(ParameterQuery::All.select(&snapshot), snapshot);
    }
}
