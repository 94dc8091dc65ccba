// ABOUTME: Second data source for conflict detection
// ABOUTME: FileMirror serves snapshots from a JSON file reloaded when it changes

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use sync_store::{Snapshot, StoreError};

use crate::error::Result;

/// A named source that can report its current value for a subscriber key.
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    fn snapshot(&self, key: &str) -> Result<Option<Snapshot>>;
}

struct Loaded {
    modified: Option<SystemTime>,
    entries: HashMap<String, Snapshot>,
}

/// Mirror backed by a JSON object of `{ key: snapshot }`.
///
/// The file is re-read whenever its modification time moves. A missing file
/// is an empty mirror.
pub struct FileMirror {
    path: PathBuf,
    loaded: Mutex<Option<Loaded>>,
}

impl FileMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, modified: Option<SystemTime>) -> Result<Loaded> {
        if modified.is_none() && !self.path.exists() {
            return Ok(Loaded {
                modified,
                entries: HashMap::new(),
            });
        }
        let raw = fs::read_to_string(&self.path).map_err(StoreError::from)?;
        let entries: HashMap<String, Snapshot> =
            serde_json::from_str(&raw).map_err(StoreError::from)?;
        tracing::debug!(
            "Loaded {} mirror entries from {}",
            entries.len(),
            self.path.display()
        );
        Ok(Loaded { modified, entries })
    }
}

impl SnapshotSource for FileMirror {
    fn name(&self) -> &str {
        "mirror"
    }

    fn snapshot(&self, key: &str) -> Result<Option<Snapshot>> {
        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        let mut loaded = self.loaded.lock().map_err(|_| StoreError::Poisoned)?;
        let stale = match loaded.as_ref() {
            Some(current) => current.modified != modified,
            None => true,
        };
        if stale {
            *loaded = Some(self.read(modified)?);
        }
        Ok(loaded
            .as_ref()
            .and_then(|current| current.entries.get(key).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let mirror = FileMirror::new(dir.path().join("mirror.json"));
        assert!(mirror.snapshot("+1").unwrap().is_none());
    }

    #[test]
    fn reloads_after_file_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        fs::write(&path, json!({"+1": {"status": "ACTIVE"}}).to_string()).unwrap();

        let mirror = FileMirror::new(&path);
        assert_eq!(mirror.snapshot("+1").unwrap().unwrap()["status"], json!("ACTIVE"));

        // Coarse filesystem clocks need a visible mtime step.
        std::thread::sleep(Duration::from_millis(1100));
        fs::write(&path, json!({"+1": {"status": "SUSPENDED"}}).to_string()).unwrap();
        assert_eq!(
            mirror.snapshot("+1").unwrap().unwrap()["status"],
            json!("SUSPENDED")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(FileMirror::new(&path).snapshot("+1").is_err());
    }
}
