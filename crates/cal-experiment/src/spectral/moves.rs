//! Turning a requested parameter set into instrument calls.
//!
//! Only parameters that differ from the instrument's readback are sent. A
//! grating or order-sorting filter change happens behind a closed shutter: the
//! shutter closes first and the requested shutter state is restored last.

use crate::control_loop::keys::{GRATING, ORDER_SORT_FILTER, SHUTTER};
use anyhow::Result;
use cal_core::{diff, values_match, Instrument, ParameterQuery, Parameters};
use serde_json::{json, Value};

const CLOSED: &str = "closed";

/// Ordered `set_parameters` batches that take `current` to `requested`.
///
/// Empty when nothing differs.
pub fn plan_moves(current: &Parameters, requested: &Parameters) -> Vec<Parameters> {
    let mut changes = diff(current, requested);
    if changes.is_empty() {
        return Vec::new();
    }

    let optics: Parameters = [GRATING, ORDER_SORT_FILTER]
        .iter()
        .filter_map(|key| changes.remove_entry(*key))
        .collect();
    if optics.is_empty() || !current.contains_key(SHUTTER) {
        changes.extend(optics);
        return vec![changes];
    }

    let closed = json!(CLOSED);
    let restore = changes
        .remove(SHUTTER)
        .or_else(|| current.get(SHUTTER).cloned());

    let mut batches = Vec::new();
    if current
        .get(SHUTTER)
        .map_or(true, |state| !values_match(state, &closed))
    {
        batches.push(shutter(closed.clone()));
    }
    batches.push(optics);
    if !changes.is_empty() {
        batches.push(changes);
    }
    if let Some(state) = restore.filter(|state| !values_match(state, &closed)) {
        batches.push(shutter(state));
    }
    batches
}

fn shutter(state: Value) -> Parameters {
    Parameters::from([(SHUTTER.to_string(), state)])
}

/// Apply `requested` to `instrument` and return its readback afterwards.
pub async fn apply_parameters(instrument: &dyn Instrument, requested: &Parameters) -> Result<Parameters> {
    let current = instrument.get_parameters(&ParameterQuery::All).await?;
    let batches = plan_moves(&current, requested);
    if batches.is_empty() {
        return Ok(current);
    }
    for batch in &batches {
        instrument.set_parameters(batch).await?;
    }
    instrument.get_parameters(&ParameterQuery::All).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cal_driver_mock::MockMonochromator;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn mono_state(wavelength: f64, grating: u64, shutter: &str) -> Parameters {
        params(&[
            ("wavelength", json!(wavelength)),
            ("grating", json!(grating)),
            ("order_sort_filter", json!(1)),
            ("shutter", json!(shutter)),
        ])
    }

    #[test]
    fn identical_parameters_need_no_moves() {
        let state = mono_state(0.5, 1, "open");
        let mut requested = state.clone();
        requested.insert("wavelength".into(), json!(0.5 + 1e-12));
        assert!(plan_moves(&state, &requested).is_empty());
    }

    #[test]
    fn wavelength_only_change_is_one_batch() {
        let batches = plan_moves(&mono_state(0.5, 1, "open"), &mono_state(0.6, 1, "open"));
        assert_eq!(batches, vec![params(&[("wavelength", json!(0.6))])]);
    }

    #[test]
    fn grating_change_happens_behind_closed_shutter() {
        let batches = plan_moves(&mono_state(0.5, 1, "open"), &mono_state(0.8, 2, "open"));
        assert_eq!(
            batches,
            vec![
                params(&[("shutter", json!("closed"))]),
                params(&[("grating", json!(2))]),
                params(&[("wavelength", json!(0.8))]),
                params(&[("shutter", json!("open"))]),
            ]
        );
    }

    #[test]
    fn already_closed_shutter_is_not_closed_again() {
        let batches = plan_moves(&mono_state(0.5, 1, "closed"), &mono_state(0.5, 2, "open"));
        assert_eq!(
            batches,
            vec![
                params(&[("grating", json!(2))]),
                params(&[("shutter", json!("open"))]),
            ]
        );
    }

    #[test]
    fn instruments_without_shutter_get_a_single_batch() {
        let current = params(&[("grating", json!(1)), ("wavelength", json!(0.5))]);
        let requested = params(&[("grating", json!(2)), ("wavelength", json!(0.9))]);
        assert_eq!(plan_moves(&current, &requested), vec![requested.clone()]);
    }

    #[tokio::test]
    async fn repeated_apply_sends_nothing_new() {
        let mono = MockMonochromator::new("cs260");
        let requested = mono_state(0.7, 2, "open");

        let readback = apply_parameters(&mono, &requested).await.unwrap();
        assert!(diff(&readback, &requested).is_empty());
        let sent = mono.set_history().len();
        assert!(sent > 0);

        apply_parameters(&mono, &requested).await.unwrap();
        assert_eq!(mono.set_history().len(), sent);
    }
}
