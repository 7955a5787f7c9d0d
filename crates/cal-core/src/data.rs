//! Measurement data produced by measuring instruments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a measuring instrument is asked to do for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRequest {
    /// Samples per second
    pub sample_rate: f64,
    /// Acquisition length in seconds
    pub sample_time: f64,
}

impl MeasureRequest {
    /// Number of samples the request asks for, at least one.
    pub fn sample_count(&self) -> usize {
        let n = (self.sample_rate * self.sample_time).round();
        if n.is_finite() && n >= 1.0 {
            n as usize
        } else {
            1
        }
    }
}

/// One timestamped reading with one value per channel (e.g. `x`, `y`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
    /// Channel name → value
    pub channels: BTreeMap<String, f64>,
}

/// Raw samples from one instrument for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Instrument id
    pub instrument: String,
    /// Samples in acquisition order
    pub samples: Vec<Sample>,
}

impl Measurement {
    /// Create an empty measurement for an instrument.
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            samples: Vec::new(),
        }
    }

    /// Reduce the samples to per-channel statistics.
    pub fn summarize(&self) -> MeasurementSummary {
        let mut sums: BTreeMap<String, (f64, f64, usize)> = BTreeMap::new();
        for sample in &self.samples {
            for (channel, value) in &sample.channels {
                let entry = sums.entry(channel.clone()).or_insert((0.0, 0.0, 0));
                entry.0 += value;
                entry.1 += value * value;
                entry.2 += 1;
            }
        }

        let channels = sums
            .into_iter()
            .map(|(channel, (sum, sum_sq, n))| {
                let count = n as f64;
                let mean = sum / count;
                // Population variance; clamp rounding noise below zero.
                let variance = (sum_sq / count - mean * mean).max(0.0);
                (
                    channel,
                    ChannelStats {
                        mean,
                        std: variance.sqrt(),
                    },
                )
            })
            .collect();

        MeasurementSummary {
            instrument: self.instrument.clone(),
            count: self.samples.len(),
            channels,
        }
    }
}

/// Mean and standard deviation of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
}

/// Compressed form of a [`Measurement`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    /// Instrument id
    pub instrument: String,
    /// Number of samples reduced
    pub count: usize,
    /// Per-channel statistics
    pub channels: BTreeMap<String, ChannelStats>,
}
