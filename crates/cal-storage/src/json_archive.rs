//! Daily JSON measurement archive.
//!
//! One file per day per storage directory, named `YY-MM-DD.json`:
//!
//! ```json
//! {
//!   "Measurements": [ { "exp_id": "...", ... }, ... ]
//! }
//! ```
//!
//! A missing file is seeded with an empty `Measurements` array. Appending
//! reads the whole document, pushes the record and rewrites the file, so
//! writers must not overlap on the same file. [`JsonArchive`] serialises all
//! appends it performs through one async mutex.

use anyhow::{anyhow, Context, Result};
use cal_core::ArchiveRecord;
use chrono::{Local, NaiveDate};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const MEASUREMENTS_KEY: &str = "Measurements";

/// Appends measurement records to daily JSON files.
#[derive(Debug, Default)]
pub struct JsonArchive {
    write_lock: Mutex<()>,
}

impl JsonArchive {
    /// Create an archive writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the archive file for `date` under `dir`.
    pub fn file_for(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("{}.json", date.format("%y-%m-%d")))
    }

    /// Append `record` to today's file under `dir`.
    pub async fn append(&self, dir: &Path, record: &ArchiveRecord) -> Result<PathBuf> {
        let path = Self::file_for(dir, Local::now().date_naive());
        self.append_value(&path, serde_json::to_value(record)?).await?;
        Ok(path)
    }

    /// Append an arbitrary JSON value to the archive file at `path`.
    pub async fn append_value(&self, path: &Path, record: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut document = match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .with_context(|| format!("Archive file {} is not valid JSON", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tracing::info!(path = %path.display(), "seeding new archive file");
                json!({ MEASUREMENTS_KEY: [] })
            }
            Err(e) => return Err(e.into()),
        };

        document
            .get_mut(MEASUREMENTS_KEY)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| {
                anyhow!(
                    "Archive file {} has no '{}' array",
                    path.display(),
                    MEASUREMENTS_KEY
                )
            })?
            .push(record);

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&document)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read every record stored at `path`.
    pub async fn read(path: &Path) -> Result<Vec<Value>> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut document: Value = serde_json::from_str(&text)?;
        match document.get_mut(MEASUREMENTS_KEY).map(Value::take) {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(anyhow!(
                "Archive file {} has no '{}' array",
                path.display(),
                MEASUREMENTS_KEY
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn missing_file_is_seeded_then_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("24-01-02.json");
        let archive = JsonArchive::new();

        archive
            .append_value(&path, json!({"exp_id": "a"}))
            .await
            .unwrap();
        archive
            .append_value(&path, json!({"exp_id": "b"}))
            .await
            .unwrap();

        let records = JsonArchive::read(&path).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r["exp_id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.json");
        let archive = Arc::new(JsonArchive::new());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let archive = archive.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                archive.append_value(&path, json!({ "n": i })).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(JsonArchive::read(&path).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn file_without_measurements_array_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{\"Other\": []}").await.unwrap();
        let err = JsonArchive::new()
            .append_value(&path, json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Measurements"));
    }

    #[test]
    fn file_name_uses_short_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            JsonArchive::file_for(Path::new("/data"), date),
            PathBuf::from("/data/24-03-09.json")
        );
    }
}
