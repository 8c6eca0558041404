//! Durable "current run" marker.
//!
//! A tiny key-value JSON file (`runs.json`) holding `currentRunId`. An absent
//! file or key means no run is current. Other keys in the file are preserved.
//! Files written with the older `current_run_id` key are still read, and the
//! old key is dropped on the next write.

use fs_err as fs;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};
use crate::run::NO_RUN;

pub const CURRENT_RUN_ID_KEY: &str = "currentRunId";
const LEGACY_CURRENT_RUN_ID_KEY: &str = "current_run_id";

#[derive(Debug, Clone)]
pub struct SessionMarker {
    path: PathBuf,
}

impl SessionMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted current run id, if any.
    pub fn load(&self) -> Result<Option<i64>> {
        let entries = self.read_entries()?;
        Ok(entries
            .get(CURRENT_RUN_ID_KEY)
            .or_else(|| entries.get(LEGACY_CURRENT_RUN_ID_KEY))
            .and_then(Value::as_i64)
            .filter(|id| *id != NO_RUN))
    }

    pub fn store(&self, run_id: i64) -> Result<()> {
        let mut entries = self.read_entries()?;
        entries.remove(LEGACY_CURRENT_RUN_ID_KEY);
        entries.insert(CURRENT_RUN_ID_KEY.to_string(), Value::from(run_id));
        self.write_entries(&entries)
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.read_entries()?;
        let removed = entries.remove(CURRENT_RUN_ID_KEY).is_some()
            | entries.remove(LEGACY_CURRENT_RUN_ID_KEY).is_some();
        if !removed && !self.path.exists() {
            return Ok(());
        }
        self.write_entries(&entries)
    }

    fn read_entries(&self) -> Result<Map<String, Value>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(TrackerError::io("Failed to read session marker", err)),
        };

        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Map::new());
        }

        serde_json::from_slice(&data)
            .map_err(|err| TrackerError::json("Failed to parse session marker", err))
    }

    fn write_entries(&self, entries: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| TrackerError::io("Failed to create session marker dir", err))?;
        }

        let payload = serde_json::to_vec_pretty(entries)
            .map_err(|err| TrackerError::json("Failed to serialize session marker", err))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .map_err(|err| TrackerError::io("Failed to write session marker", err))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| TrackerError::io("Failed to commit session marker", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_no_current_run() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let marker = SessionMarker::new(temp_dir.path().join("runs.json"));
        assert_eq!(marker.load().expect("load"), None);
    }

    #[test]
    fn stores_and_clears_current_run() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let marker = SessionMarker::new(temp_dir.path().join("runs.json"));

        marker.store(7).expect("store");
        assert_eq!(marker.load().expect("load"), Some(7));

        let reopened = SessionMarker::new(marker.path().to_path_buf());
        assert_eq!(reopened.load().expect("load"), Some(7));

        marker.clear().expect("clear");
        assert_eq!(marker.load().expect("load"), None);
    }

    #[test]
    fn sentinel_value_reads_as_absent() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.json");
        fs::write(&path, r#"{"currentRunId": -1}"#).expect("write");
        assert_eq!(SessionMarker::new(path).load().expect("load"), None);
    }

    #[test]
    fn writes_camel_case_key() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.json");
        SessionMarker::new(path.clone()).store(5).expect("store");

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).expect("read"))
            .expect("parse");
        assert_eq!(raw, serde_json::json!({ "currentRunId": 5 }));
    }

    #[test]
    fn reads_and_replaces_legacy_key() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.json");
        fs::write(&path, r#"{"current_run_id": 9}"#).expect("write");

        let marker = SessionMarker::new(path.clone());
        assert_eq!(marker.load().expect("load"), Some(9));

        marker.clear().expect("clear");
        assert_eq!(marker.load().expect("load"), None);
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).expect("read"))
            .expect("parse");
        assert!(raw.get("current_run_id").is_none());
    }

    #[test]
    fn preserves_unrelated_keys() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.json");
        fs::write(&path, r#"{"units": "metric"}"#).expect("write");

        let marker = SessionMarker::new(path.clone());
        marker.store(3).expect("store");
        marker.clear().expect("clear");

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).expect("read"))
            .expect("parse");
        assert_eq!(raw["units"], "metric");
        assert!(raw.get(CURRENT_RUN_ID_KEY).is_none());
    }

    #[test]
    fn clear_without_file_does_not_create_one() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.json");
        SessionMarker::new(path.clone()).clear().expect("clear");
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_marker_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("runs.json");
        fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            SessionMarker::new(path).load(),
            Err(TrackerError::Json { .. })
        ));
    }
}
