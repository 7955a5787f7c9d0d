//! Wavelength-threshold transition tables.
//!
//! Settings such as grating, order-sorting filter, lock-in sensitivity and
//! ND-filter position change as the monochromator sweeps. Each is described by
//! a table of `(wavelength threshold, value)` entries. Walking a
//! non-decreasing wavelength list, the active value is the first entry's until
//! the wavelength strictly exceeds the next entry's threshold; the cursor never
//! moves past the last entry.

use serde::{Deserialize, Serialize};

/// One row of a transition table.
pub trait Threshold {
    /// Setting the row selects.
    type Value: Clone;

    /// Wavelength (µm) that must be strictly exceeded to select this row.
    fn threshold(&self) -> f64;

    /// Setting selected by this row.
    fn value(&self) -> Self::Value;
}

/// Grating change point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GratingTransition {
    /// Threshold wavelength (µm).
    pub wavelength: f64,
    /// Grating index.
    pub grating: u8,
}

/// Order-sorting filter change point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OsfTransition {
    /// Threshold wavelength (µm).
    pub wavelength: f64,
    /// Filter index.
    pub osf: u8,
}

/// Lock-in sensitivity change point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitivityTransition {
    /// Threshold wavelength (µm).
    pub wavelength: f64,
    /// Full-scale sensitivity (V).
    pub sensitivity: f64,
}

/// ND filter wheel change point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTransition {
    /// Threshold wavelength (µm).
    pub wavelength: f64,
    /// Wheel position.
    pub position: u8,
}

impl Threshold for GratingTransition {
    type Value = u8;
    fn threshold(&self) -> f64 {
        self.wavelength
    }
    fn value(&self) -> u8 {
        self.grating
    }
}

impl Threshold for OsfTransition {
    type Value = u8;
    fn threshold(&self) -> f64 {
        self.wavelength
    }
    fn value(&self) -> u8 {
        self.osf
    }
}

impl Threshold for SensitivityTransition {
    type Value = f64;
    fn threshold(&self) -> f64 {
        self.wavelength
    }
    fn value(&self) -> f64 {
        self.sensitivity
    }
}

impl Threshold for PositionTransition {
    type Value = u8;
    fn threshold(&self) -> f64 {
        self.wavelength
    }
    fn value(&self) -> u8 {
        self.position
    }
}

/// Monotone cursor over a transition table.
#[derive(Debug)]
pub struct TransitionCursor<'a, T: Threshold> {
    table: &'a [T],
    next: usize,
    current: T::Value,
}

impl<'a, T: Threshold> TransitionCursor<'a, T> {
    /// Cursor at the first entry; `None` for an empty table.
    pub fn new(table: &'a [T]) -> Option<Self> {
        let first = table.first()?;
        Some(Self {
            table,
            next: 1,
            current: first.value(),
        })
    }

    /// Value active at `wavelength`. Wavelengths must be fed in
    /// non-decreasing order.
    pub fn advance(&mut self, wavelength: f64) -> T::Value {
        while let Some(entry) = self.table.get(self.next) {
            if wavelength > entry.threshold() {
                self.current = entry.value();
                self.next += 1;
            } else {
                break;
            }
        }
        self.current.clone()
    }

    /// Index of the active entry.
    pub fn position(&self) -> usize {
        self.next - 1
    }
}

/// Active value for every wavelength; `None` for an empty table.
pub fn resolve<T: Threshold>(table: &[T], wavelengths: &[f64]) -> Option<Vec<T::Value>> {
    let mut cursor = TransitionCursor::new(table)?;
    Some(wavelengths.iter().map(|w| cursor.advance(*w)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gratings() -> Vec<GratingTransition> {
        vec![
            GratingTransition { wavelength: 0.0, grating: 1 },
            GratingTransition { wavelength: 0.7, grating: 2 },
            GratingTransition { wavelength: 1.4, grating: 3 },
        ]
    }

    #[test]
    fn threshold_must_be_strictly_exceeded() {
        let values = resolve(&gratings(), &[0.5, 0.7, 0.71, 1.4, 1.5]).unwrap();
        assert_eq!(values, vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn first_entry_applies_before_any_threshold() {
        let table = vec![
            OsfTransition { wavelength: 0.6, osf: 2 },
            OsfTransition { wavelength: 0.9, osf: 3 },
        ];
        assert_eq!(resolve(&table, &[0.3, 0.6, 0.8]).unwrap(), vec![2, 2, 3]);
    }

    #[test]
    fn cursor_stays_on_last_entry() {
        let table = gratings();
        let mut cursor = TransitionCursor::new(&table).unwrap();
        assert_eq!(cursor.advance(5.0), 3);
        assert_eq!(cursor.advance(50.0), 3);
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn empty_table_has_no_cursor() {
        let table: Vec<SensitivityTransition> = Vec::new();
        assert!(TransitionCursor::new(&table).is_none());
        assert!(resolve(&table, &[0.5]).is_none());
    }

    #[test]
    fn active_value_is_last_exceeded_threshold() {
        let table = gratings();
        let waves: Vec<f64> = (0..40).map(|i| 0.05 * f64::from(i)).collect();
        let values = resolve(&table, &waves).unwrap();
        for (w, v) in waves.iter().zip(values) {
            let expected = table
                .iter()
                .skip(1)
                .filter(|t| *w > t.wavelength)
                .last()
                .map_or(table[0].grating, |t| t.grating);
            assert_eq!(v, expected, "wavelength {w}");
        }
    }
}
