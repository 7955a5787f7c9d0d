//! Per-sequence CSV files of raw samples.
//!
//! Each measuring instrument gets `<dir>/<sequence>_<instrument>.csv` with one
//! row per sample:
//!
//! ```text
//! exp_id,timestamp,x,y
//! 20240102_101500_1,2024-01-02T10:15:00.12Z,0.00101,0.0000032
//! ```
//!
//! The header is written when the file is created; channel columns follow the
//! first measurement written to it.

use anyhow::{Context, Result};
use cal_core::Measurement;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Appends raw samples to per-sequence CSV files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleCsvWriter;

impl SampleCsvWriter {
    /// Path of the CSV file for one sequence and instrument.
    pub fn file_for(dir: &Path, sequence_name: &str, instrument: &str) -> PathBuf {
        let stem: String = format!("{}_{}", sequence_name, instrument)
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{}.csv", stem))
    }

    /// Append every sample of `measurement`, tagged with `exp_id`.
    ///
    /// File I/O runs on the blocking pool.
    pub async fn append(
        &self,
        dir: &Path,
        sequence_name: &str,
        exp_id: &str,
        measurement: &Measurement,
    ) -> Result<PathBuf> {
        let path = Self::file_for(dir, sequence_name, &measurement.instrument);
        let exp_id = exp_id.to_string();
        let measurement = measurement.clone();
        let target = path.clone();

        tokio::task::spawn_blocking(move || write_rows(&target, &exp_id, &measurement))
            .await??;
        Ok(path)
    }
}

fn write_rows(path: &Path, exp_id: &str, measurement: &Measurement) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let is_new = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);

    let channels: Vec<String> = measurement
        .samples
        .first()
        .map(|s| s.channels.keys().cloned().collect())
        .unwrap_or_default();

    if is_new {
        let mut header = vec!["exp_id".to_string(), "timestamp".to_string()];
        header.extend(channels.iter().cloned());
        writer.write_record(&header)?;
    }

    for sample in &measurement.samples {
        let mut row = vec![exp_id.to_string(), sample.timestamp.to_rfc3339()];
        row.extend(channels.iter().map(|c| {
            sample
                .channels
                .get(c)
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}
