//! File Access Tracker - detects files that change between validation and apply
//!
//! The validator records every file it reads while dry-running a patch. Before
//! the applicator touches the tree it asks the tracker whether any of those
//! files changed underneath it; a stale file means the validation no longer
//! holds.

use crate::error::{HealError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

/// Thread-safe record of what each file looked like when it was read.
#[derive(Debug, Clone, Default)]
pub struct FileAccessTracker {
    /// `None` records that the file was absent when read.
    fingerprints: Arc<RwLock<HashMap<PathBuf, Option<Fingerprint>>>>,
}

impl FileAccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a file has been read (or found missing).
    pub fn record_read(&self, path: &Path) {
        let fingerprint = Fingerprint::of(path);
        if let Ok(mut map) = self.fingerprints.write() {
            map.insert(path.to_path_buf(), fingerprint);
        }
    }

    /// Check if a file is stale (modified, created or deleted since last read)
    ///
    /// Files that were never recorded are not considered stale.
    ///
    /// # Errors
    /// Returns `HealError::FileStale` if the file no longer matches what was read.
    pub fn check_staleness(&self, path: &Path) -> Result<()> {
        let recorded = {
            let map = self
                .fingerprints
                .read()
                .map_err(|_| HealError::TrackerPoisoned)?;
            map.get(path).copied()
        };

        let Some(recorded) = recorded else {
            return Ok(());
        };

        if Fingerprint::of(path) != recorded {
            return Err(HealError::FileStale {
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    /// Check every recorded file, reporting the first stale one.
    pub fn check_all(&self) -> Result<()> {
        let paths: Vec<PathBuf> = {
            let map = self
                .fingerprints
                .read()
                .map_err(|_| HealError::TrackerPoisoned)?;
            map.keys().cloned().collect()
        };

        for path in paths {
            self.check_staleness(&path)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.fingerprints.read().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_record_and_check_fresh_file() {
        let tracker = FileAccessTracker::new();
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"initial content").unwrap();
        temp_file.flush().unwrap();

        tracker.record_read(temp_file.path());
        assert!(tracker.check_staleness(temp_file.path()).is_ok());
        assert!(tracker.check_all().is_ok());
    }

    #[test]
    fn test_detect_modified_file() {
        let tracker = FileAccessTracker::new();
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"initial content").unwrap();
        temp_file.flush().unwrap();

        let path = temp_file.path().to_path_buf();
        tracker.record_read(&path);

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, b"modified content!").unwrap();

        match tracker.check_staleness(&path) {
            Err(HealError::FileStale { .. }) => (),
            other => panic!("Expected FileStale error, got {:?}", other),
        }
        assert!(tracker.check_all().is_err());
    }

    #[test]
    fn test_detect_file_created_after_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.txt");
        let tracker = FileAccessTracker::new();

        tracker.record_read(&path);
        assert!(tracker.check_staleness(&path).is_ok());

        std::fs::write(&path, "surprise").unwrap();
        assert!(tracker.check_staleness(&path).is_err());
    }

    #[test]
    fn test_poisoned_tracker_refuses_checks() {
        let tracker = FileAccessTracker::new();
        let temp_file = NamedTempFile::new().unwrap();
        tracker.record_read(temp_file.path());

        let shared = tracker.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.fingerprints.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(matches!(
            tracker.check_staleness(temp_file.path()),
            Err(HealError::TrackerPoisoned)
        ));
        assert!(matches!(tracker.check_all(), Err(HealError::TrackerPoisoned)));
    }

    #[test]
    fn test_unread_file_not_stale() {
        let tracker = FileAccessTracker::new();
        let temp_file = NamedTempFile::new().unwrap();
        assert!(tracker.check_staleness(temp_file.path()).is_ok());
        assert_eq!(tracker.tracked_count(), 0);
    }
}
