//! Change detection over the live database files.
//!
//! The `watch` command has no hook into the app's write path, so it polls
//! size and modification time of each database and its side files.

use crate::snapshot::locator::{side_file, DatabaseLocator, SIDE_FILE_SUFFIXES};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Size and mtime of one file; `None` while it does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified_nanos: u128,
}

impl FileStamp {
    pub fn from_path(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        let modified_nanos = metadata
            .modified()
            .ok()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        Some(Self {
            size: metadata.len(),
            modified_nanos,
        })
    }
}

pub struct ChangeDetector {
    stamps: BTreeMap<PathBuf, Option<FileStamp>>,
}

impl ChangeDetector {
    /// Record the current state of every database file and side file.
    pub fn new(databases: &[String], locator: &dyn DatabaseLocator) -> Self {
        let mut paths = Vec::new();
        for name in databases {
            let main = locator.resolve(name);
            for suffix in SIDE_FILE_SUFFIXES {
                paths.push(side_file(&main, suffix));
            }
            paths.push(main);
        }

        Self {
            stamps: paths
                .into_iter()
                .map(|p| {
                    let stamp = FileStamp::from_path(&p);
                    (p, stamp)
                })
                .collect(),
        }
    }

    /// True when any watched file changed, appeared or vanished since the last poll.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        for (path, last) in self.stamps.iter_mut() {
            let now = FileStamp::from_path(path);
            if now != *last {
                *last = now;
                changed = true;
            }
        }
        changed
    }

    /// Take the current state as the new baseline without reporting it.
    pub fn rebaseline(&mut self) {
        self.poll();
    }

    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.stamps.keys().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::locator::SqliteLocator;
    use tempfile::TempDir;

    #[test]
    fn test_detects_write_and_side_file_creation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ledgerDB.db"), b"v1").unwrap();
        let locator = SqliteLocator::new(dir.path().to_path_buf(), vec![]);

        let mut detector = ChangeDetector::new(&["ledgerDB.db".to_string()], &locator);
        assert_eq!(detector.watched().count(), 3);
        assert!(!detector.poll());

        std::fs::write(dir.path().join("ledgerDB.db-wal"), b"log").unwrap();
        assert!(detector.poll());
        assert!(!detector.poll());

        std::fs::write(dir.path().join("ledgerDB.db"), b"version two").unwrap();
        assert!(detector.poll());

        std::fs::remove_file(dir.path().join("ledgerDB.db-wal")).unwrap();
        detector.rebaseline();
        assert!(!detector.poll());
    }
}
