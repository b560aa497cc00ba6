//! Capture segment directory.
//!
//! Every captured rotation unit lands in its own file named
//! `<prefix>_<YYYYMMDD>_<HHMMSS>_<micros>.pcap`. The timestamp is UTC with
//! fixed-width fields, so plain lexicographic order of file names is capture
//! order. Nothing here holds locks: callers list, act, and re-list when the
//! capture writer races them.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, trace};

use crate::error::StorageError;

const SEGMENT_EXTENSION: &str = "pcap";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// One raw capture file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Segment {
    path: PathBuf,
}

impl Segment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &OsStr {
        self.path.file_name().unwrap_or_default()
    }

    /// Capture time encoded in the file name, if the name follows our scheme.
    pub fn created_at(&self, prefix: &str) -> Option<DateTime<Utc>> {
        let name = self.path.file_stem()?.to_str()?;
        let stamp = name.strip_prefix(prefix)?.strip_prefix('_')?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// The directory of capture segments.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    prefix: String,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the segment directory if needed.
    pub fn ensure_directory(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StorageError::Unavailable {
            path: self.dir.clone(),
            source,
        })?;
        debug!("Capture segments are stored in {}", self.dir.display());
        Ok(())
    }

    /// Path for a new segment captured now.
    pub fn next_segment_path(&self) -> PathBuf {
        self.segment_path_at(Utc::now())
    }

    /// Path for a segment captured at `at`.
    pub fn segment_path_at(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.{}",
            self.prefix,
            at.format(TIMESTAMP_FORMAT),
            SEGMENT_EXTENSION
        ))
    }

    /// Returns true if `name` is a segment file name of this store.
    pub fn is_segment_name(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('_'))
            && Path::new(name).extension() == Some(OsStr::new(SEGMENT_EXTENSION))
    }

    /// Lists segments, oldest first.
    ///
    /// A missing directory lists as empty.
    pub fn list(&self) -> Result<Vec<Segment>, StorageError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::List {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut segments: Vec<Segment> = entries
            // Entries that vanish mid-listing are the writer racing us.
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| self.is_segment_name(name))
                    .unwrap_or(false)
            })
            .map(|entry| Segment::new(entry.path()))
            .collect();

        segments.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        trace!("Listed {} segments in {}", segments.len(), self.dir.display());
        Ok(segments)
    }

    /// Deletes a segment. A segment that is already gone counts as deleted.
    pub fn delete(&self, segment: &Segment) -> Result<(), StorageError> {
        match std::fs::remove_file(segment.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!("Segment {} already removed", segment);
                Ok(())
            }
            Err(source) => Err(StorageError::Delete {
                path: segment.path().to_path_buf(),
                source,
            }),
        }
    }
}
