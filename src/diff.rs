//! Diff between the live filesystem view and the stored index metadata.
//!
//! Classification happens on mtime alone; a `changed` verdict is only a
//! candidate until the index builder confirms it by content hash, so a bare
//! `touch` never rewrites the index.

use std::collections::{HashMap, HashSet};

use crate::scan::FsEntry;
use crate::store::StoredFileMeta;

/// Coarse-filesystem tolerance: mtimes within this window count as equal.
pub const MTIME_TOLERANCE_MS: i64 = 1000;

/// Outcome of diffing the filesystem against the store.
#[derive(Debug, Default)]
pub struct IndexDiff {
    /// Present on disk, absent from the store.
    pub added: Vec<FsEntry>,
    /// Present in both with mtime drift beyond tolerance. Candidates only:
    /// the builder dismisses them when the content hash still matches.
    pub changed: Vec<FsEntry>,
    /// Present in the store, gone from disk.
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Classify every path visible after ignore filtering, plus stored paths
/// that vanished from the view.
pub fn diff_index(fs_view: Vec<FsEntry>, stored: &[StoredFileMeta]) -> IndexDiff {
    let stored_by_path: HashMap<&str, &StoredFileMeta> =
        stored.iter().map(|m| (m.path.as_str(), m)).collect();

    let present: HashSet<String> = fs_view.iter().map(|e| e.rel_path.clone()).collect();

    let mut diff = IndexDiff::default();
    for entry in fs_view {
        match stored_by_path.get(entry.rel_path.as_str()) {
            None => diff.added.push(entry),
            Some(meta) => {
                if (entry.mtime - meta.mtime).abs() <= MTIME_TOLERANCE_MS {
                    diff.unchanged += 1;
                } else {
                    diff.changed.push(entry);
                }
            }
        }
    }
    diff.deleted = stored
        .iter()
        .filter(|m| !present.contains(m.path.as_str()))
        .map(|m| m.path.clone())
        .collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fs_entry(path: &str, mtime: i64) -> FsEntry {
        FsEntry {
            rel_path: path.to_string(),
            abs_path: PathBuf::from(path),
            size: 10,
            mtime,
        }
    }

    fn stored(path: &str, mtime: i64) -> StoredFileMeta {
        StoredFileMeta { path: path.to_string(), mtime, hash: 0, size: 10 }
    }

    #[test]
    fn test_new_path_is_added() {
        let diff = diff_index(vec![fs_entry("a.rs", 5000)], &[]);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.changed.is_empty() && diff.deleted.is_empty());
        assert_eq!(diff.unchanged, 0);
    }

    #[test]
    fn test_mtime_within_tolerance_is_unchanged() {
        let diff = diff_index(vec![fs_entry("a.rs", 5900)], &[stored("a.rs", 5000)]);
        assert_eq!(diff.unchanged, 1);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_mtime_beyond_tolerance_is_changed_candidate() {
        let diff = diff_index(vec![fs_entry("a.rs", 7001)], &[stored("a.rs", 5000)]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.unchanged, 0);
    }

    #[test]
    fn test_tolerance_is_symmetric() {
        // stored mtime in the future (clock skew, restored backups)
        let diff = diff_index(vec![fs_entry("a.rs", 5000)], &[stored("a.rs", 5900)]);
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn test_missing_path_is_deleted() {
        let diff = diff_index(vec![fs_entry("keep.rs", 1000)], &[
            stored("keep.rs", 1000),
            stored("gone.rs", 1000),
        ]);
        assert_eq!(diff.deleted, vec!["gone.rs".to_string()]);
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn test_mixed_classification() {
        let fs = vec![
            fs_entry("same.rs", 1000),
            fs_entry("drift.rs", 9000),
            fs_entry("new.rs", 1000),
        ];
        let st = vec![stored("same.rs", 1500), stored("drift.rs", 1000), stored("old.rs", 1)];
        let diff = diff_index(fs, &st);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.deleted, vec!["old.rs".to_string()]);
        assert_eq!(diff.unchanged, 1);
    }
}
