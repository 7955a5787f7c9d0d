//! Typed access to parameter map entries.

use anyhow::{anyhow, Result};
use cal_core::Parameters;
use serde_json::Value;

/// Read `key` as a float if present.
pub fn get_f64(params: &Parameters, key: &str) -> Result<Option<f64>> {
    params
        .get(key)
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| anyhow!("parameter '{}' must be a number, got {}", key, v))
        })
        .transpose()
}

/// Read `key` as a non-negative integer if present.
pub fn get_u64(params: &Parameters, key: &str) -> Result<Option<u64>> {
    params
        .get(key)
        .map(|v| match v {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| anyhow!("parameter '{}' must be a whole number, got {}", key, v)),
            other => Err(anyhow!("parameter '{}' must be a whole number, got {}", key, other)),
        })
        .transpose()
}

/// Read `key` as a string if present.
pub fn get_str<'a>(params: &'a Parameters, key: &str) -> Result<Option<&'a str>> {
    params
        .get(key)
        .map(|v| {
            v.as_str()
                .ok_or_else(|| anyhow!("parameter '{}' must be a string, got {}", key, v))
        })
        .transpose()
}

/// Reject keys the instrument does not know.
pub fn reject_unknown(params: &Parameters, known: &[&str], instrument: &str) -> Result<()> {
    match params.keys().find(|k| !known.contains(&k.as_str())) {
        Some(key) => Err(anyhow!("{} has no parameter '{}'", instrument, key)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_number_accepts_integral_float() {
        let mut p = Parameters::new();
        p.insert("grating".into(), json!(2.0));
        assert_eq!(get_u64(&p, "grating").unwrap(), Some(2));
        p.insert("grating".into(), json!(2.5));
        assert!(get_u64(&p, "grating").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut p = Parameters::new();
        p.insert("colour".into(), json!("blue"));
        assert!(reject_unknown(&p, &["wavelength"], "cs260").is_err());
    }
}
