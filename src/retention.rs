//! Bounded retention of capture segments.
//!
//! Two operations: `trim` keeps the newest N segments of a sorted list, and
//! `reset_all` purges everything except an explicit set of in-flight files.
//! Both are total. Deleting a file the capture writer already removed (or
//! never finished) is not an error.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::segment::{Segment, SegmentStore};

/// Decides which segments survive.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    store: SegmentStore,
}

impl RetentionPolicy {
    pub fn new(store: SegmentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    /// Deletes everything but the `max_retained` most recent segments.
    ///
    /// `segments` must be sorted oldest first. Survivors are returned in the
    /// same order. A segment whose deletion fails is logged and left out of
    /// the survivors as well: the caller must never merge more than
    /// `max_retained` inputs.
    pub fn trim(&self, segments: Vec<Segment>, max_retained: usize) -> Vec<Segment> {
        if segments.len() <= max_retained {
            return segments;
        }

        let mut segments = segments;
        let survivors = segments.split_off(segments.len() - max_retained);

        for segment in &segments {
            if let Err(e) = self.store.delete(segment) {
                warn!("Failed to evict old segment: {}", e);
            }
        }

        debug!(
            "Evicted {} old segments, {} retained",
            segments.len(),
            survivors.len()
        );
        survivors
    }

    /// Deletes every segment in the store except those named in `exceptions`.
    ///
    /// Exceptions are compared by file name, so absolute and relative forms of
    /// the same path are equivalent. Returns the segments that were removed.
    pub fn reset_all<P: AsRef<Path>>(
        &self,
        exceptions: &[P],
    ) -> Result<Vec<Segment>, StorageError> {
        let keep: HashSet<OsString> = exceptions
            .iter()
            .filter_map(|p| p.as_ref().file_name().map(|n| n.to_os_string()))
            .collect();

        let mut removed = Vec::new();
        for segment in self.store.list()? {
            if keep.contains(segment.file_name()) {
                continue;
            }
            self.store.delete(&segment)?;
            removed.push(segment);
        }

        if !removed.is_empty() {
            debug!("Reset removed {} segments", removed.len());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::touch_all;

    fn numbered(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("seg_{:04}.pcap", i)).collect()
    }

    fn setup(count: usize) -> (tempfile::TempDir, RetentionPolicy) {
        let dir = tempfile::tempdir().unwrap();
        let names = numbered(count);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        touch_all(dir.path(), &refs);
        let policy = RetentionPolicy::new(SegmentStore::new(dir.path(), "seg"));
        (dir, policy)
    }

    fn names(segments: &[Segment]) -> Vec<String> {
        segments
            .iter()
            .map(|s| s.file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_trim_keeps_most_recent_suffix() {
        let (_dir, policy) = setup(10);
        let segments = policy.store().list().unwrap();

        let survivors = policy.trim(segments, 7);

        let expected: Vec<String> = (4..=10).map(|i| format!("seg_{:04}.pcap", i)).collect();
        assert_eq!(names(&survivors), expected);
        assert_eq!(names(&policy.store().list().unwrap()), expected);
    }

    #[test]
    fn test_trim_never_exceeds_window() {
        for count in 0..12 {
            for k in 1..12 {
                let (_dir, policy) = setup(count);
                let segments = policy.store().list().unwrap();
                let expected: Vec<String> =
                    names(&segments[segments.len().saturating_sub(k)..]);

                let survivors = policy.trim(segments, k);

                assert!(survivors.len() <= k);
                assert_eq!(names(&survivors), expected);
            }
        }
    }

    #[test]
    fn test_trim_empty_is_noop() {
        let (_dir, policy) = setup(0);
        assert!(policy.trim(Vec::new(), 3).is_empty());
    }

    #[test]
    fn test_trim_tolerates_already_deleted_segments() {
        let (dir, policy) = setup(5);
        let segments = policy.store().list().unwrap();
        std::fs::remove_file(dir.path().join("seg_0001.pcap")).unwrap();

        let survivors = policy.trim(segments, 2);

        assert_eq!(names(&survivors), vec!["seg_0004.pcap", "seg_0005.pcap"]);
        assert_eq!(policy.store().list().unwrap().len(), 2);
    }

    #[test]
    fn test_reset_all_keeps_only_exceptions() {
        let all = numbered(6);
        let subsets: Vec<Vec<&str>> = vec![
            vec![],
            vec!["seg_0006.pcap"],
            vec!["seg_0001.pcap", "seg_0004.pcap"],
            all.iter().map(String::as_str).collect(),
        ];

        for keep in subsets {
            let (dir, policy) = setup(6);
            let exceptions: Vec<_> = keep.iter().map(|n| dir.path().join(n)).collect();

            let removed = policy.reset_all(&exceptions).unwrap();

            let remaining = names(&policy.store().list().unwrap());
            assert_eq!(remaining, keep);
            assert_eq!(removed.len(), 6 - keep.len());
        }
    }

    #[test]
    fn test_reset_all_matches_by_file_name() {
        let (_dir, policy) = setup(3);
        policy.reset_all(&["seg_0002.pcap"]).unwrap();
        assert_eq!(names(&policy.store().list().unwrap()), vec!["seg_0002.pcap"]);
    }

    #[test]
    fn test_reset_all_on_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetentionPolicy::new(SegmentStore::new(dir.path().join("gone"), "seg"));
        let none: [&Path; 0] = [];
        assert!(policy.reset_all(&none).unwrap().is_empty());
    }
}
