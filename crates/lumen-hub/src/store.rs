use lumen_core::model::HealthSnapshot;
use lumen_core::protocol::validate_snapshot;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid snapshot in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<HealthSnapshot>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let snapshot: HealthSnapshot =
            serde_json::from_str(&raw).map_err(|err| StoreError::Invalid {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        validate_snapshot(&snapshot).map_err(|err| StoreError::Invalid {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &HealthSnapshot) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string_pretty(snapshot).map_err(|err| StoreError::Invalid {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        write_atomic(&self.path, &payload)
    }
}

fn write_atomic(path: &Path, payload: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };

    std::fs::write(&temp_path, payload).map_err(|source| StoreError::Write {
        path: temp_path.clone(),
        source,
    })?;
    std::fs::rename(&temp_path, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lumen_core::model::{Region, RegionStatus};

    fn sample() -> HealthSnapshot {
        let mut snapshot = HealthSnapshot::empty("demo", Utc::now());
        snapshot.illumination = 0.42;
        snapshot.regions.insert(
            "core-logic".to_string(),
            Region {
                status: RegionStatus::Healthy,
                coverage: 88.0,
                test_count: 3,
                passing_tests: 3,
                failing_tests: 0,
                file_count: 7,
                last_modified: None,
            },
        );
        snapshot
    }

    #[test]
    fn save_then_load_returns_same_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("state").join("neural_status.json"));
        assert!(store.load().expect("load").is_none());

        let snapshot = sample();
        store.save(&snapshot).expect("save");
        assert_eq!(store.load().expect("load"), Some(snapshot));
        assert!(!dir
            .path()
            .join("state")
            .join("neural_status.json.tmp")
            .exists());
    }

    #[test]
    fn corrupt_or_out_of_range_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("neural_status.json");
        let store = SnapshotStore::new(&path);

        std::fs::write(&path, "{ nope").expect("write");
        assert!(matches!(store.load(), Err(StoreError::Invalid { .. })));

        let mut snapshot = sample();
        snapshot.illumination = 3.0;
        std::fs::write(&path, serde_json::to_string(&snapshot).expect("json")).expect("write");
        assert!(matches!(store.load(), Err(StoreError::Invalid { .. })));
    }
}
