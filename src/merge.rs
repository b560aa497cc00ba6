//! Cumulative snapshot construction.
//!
//! The retained segments are concatenated, oldest first, into one capture
//! file at a fixed path by an external merge tool
//! (`<merge-tool> -w <snapshot> <segment>...`). Every failure here is scoped
//! to the current cycle.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MergeError, StorageError};
use crate::retention::RetentionPolicy;
use crate::segment::Segment;
use crate::shutdown::Shutdown;
use crate::subprocess::kill_process_group;

/// Builds the snapshot from retained segments.
#[derive(Debug, Clone)]
pub struct MergeCoordinator {
    retention: RetentionPolicy,
    merge_tool: String,
    snapshot_path: PathBuf,
    max_retained: usize,
}

impl MergeCoordinator {
    pub fn new(
        retention: RetentionPolicy,
        merge_tool: impl Into<String>,
        snapshot_path: impl Into<PathBuf>,
        max_retained: usize,
    ) -> Self {
        Self {
            retention,
            merge_tool: merge_tool.into(),
            snapshot_path: snapshot_path.into(),
            max_retained,
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Trims the current segment listing and merges the survivors.
    pub async fn merge_current(&self, shutdown: &Shutdown) -> Result<PathBuf, MergeError> {
        let segments = self.retention.store().list()?;
        self.merge(segments, shutdown).await
    }

    /// Merges `segments` (sorted oldest first) into the snapshot.
    ///
    /// The list is trimmed to the retention window first, so the merge tool
    /// never sees more than `max_retained` inputs. Shutdown kills a running
    /// merge tool and yields [`MergeError::Cancelled`].
    pub async fn merge(
        &self,
        segments: Vec<Segment>,
        shutdown: &Shutdown,
    ) -> Result<PathBuf, MergeError> {
        let segments = self.retention.trim(segments, self.max_retained);
        if segments.is_empty() {
            return Err(MergeError::NoSegments);
        }

        self.remove_stale_snapshot()?;

        let mut command = Command::new(&self.merge_tool);
        command
            .arg("-w")
            .arg(&self.snapshot_path)
            .args(segments.iter().map(Segment::path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|source| MergeError::Spawn {
                tool: self.merge_tool.clone(),
                source,
            })?;

        let pid = child.id();
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| MergeError::Spawn {
                tool: self.merge_tool.clone(),
                source,
            })?,
            _ = shutdown.triggered() => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                debug!("Shutdown requested, {} killed", self.merge_tool);
                return Err(MergeError::Cancelled);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                warn!("{} stderr: {}", self.merge_tool, stderr.trim());
            }
            return Err(MergeError::ToolFailed {
                tool: self.merge_tool.clone(),
                status: output.status.to_string(),
            });
        }

        if !self.snapshot_path.exists() {
            return Err(MergeError::MissingOutput {
                path: self.snapshot_path.clone(),
            });
        }

        debug!(
            "Merged {} segments into {}",
            segments.len(),
            self.snapshot_path.display()
        );
        Ok(self.snapshot_path.clone())
    }

    fn remove_stale_snapshot(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.snapshot_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Delete {
                path: self.snapshot_path.clone(),
                source,
            }),
        }
    }
}
