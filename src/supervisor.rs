//! The capture loop.
//!
//! One long-lived task drives every cycle through
//!
//! ```text
//! Capturing -> [Resetting] -> Trimming -> Merging -> Classifying -> Deciding
//! ```
//!
//! and stops only on shutdown. Failures after capture are scoped to the
//! cycle: they are logged, counted, and the loop moves on to the next unit.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::capture::{CaptureOutcome, SegmentCapture};
use crate::config::Config;
use crate::decision::{AlertDecisionEngine, Decision, PipelineState};
use crate::error::{MergeError, StartupError, StorageError};
use crate::inference::{InferenceInvoker, InferenceOutcome};
use crate::merge::MergeCoordinator;
use crate::metrics::{Metrics, SharedMetrics};
use crate::retention::RetentionPolicy;
use crate::segment::SegmentStore;
use crate::shutdown::Shutdown;

const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Capturing,
    Resetting,
    Trimming,
    Merging,
    Classifying,
    Deciding,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capturing => write!(f, "capturing"),
            Self::Resetting => write!(f, "resetting"),
            Self::Trimming => write!(f, "trimming"),
            Self::Merging => write!(f, "merging"),
            Self::Classifying => write!(f, "classifying"),
            Self::Deciding => write!(f, "deciding"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Shutdown was requested.
    Stopped,
    /// The capture tool did not produce a segment.
    CaptureFailed,
    /// No snapshot could be built.
    NoSnapshot,
    /// The classifier produced no verdict.
    NoVerdict,
    Decided(Decision),
}

/// Owns the pipeline components and runs the loop.
pub struct CaptureSupervisor {
    store: SegmentStore,
    capture: SegmentCapture,
    retention: RetentionPolicy,
    merger: MergeCoordinator,
    inference: InferenceInvoker,
    engine: AlertDecisionEngine,
    pipeline: PipelineState,
    metrics: SharedMetrics,
    max_retained: usize,
    current: SupervisorState,
}

impl CaptureSupervisor {
    pub fn new(
        config: &Config,
        interfaces: Vec<String>,
        engine: AlertDecisionEngine,
        pipeline: PipelineState,
        metrics: SharedMetrics,
    ) -> Self {
        let store = SegmentStore::new(
            &config.capture.segment_dir,
            &config.capture.segment_prefix,
        );
        let retention = RetentionPolicy::new(store.clone());
        let max_retained = config.retention.max_retained_segments;
        let merger = MergeCoordinator::new(
            retention.clone(),
            &config.merge.merge_tool,
            config.snapshot_path(),
            max_retained,
        );

        Self {
            capture: SegmentCapture::new(&config.capture, interfaces),
            inference: InferenceInvoker::new(&config.inference),
            store,
            retention,
            merger,
            engine,
            pipeline,
            metrics,
            max_retained,
            current: SupervisorState::Stopped,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.current
    }

    fn enter(&mut self, state: SupervisorState) {
        trace!("Supervisor {} -> {}", self.current, state);
        self.current = state;
    }

    /// Prepares the segment directory and removes leftovers of earlier runs:
    /// segments, the snapshot and classifier result files.
    pub fn startup_cleanup(&self) -> Result<(), StartupError> {
        self.store.ensure_directory()?;

        let removed = self.retention.reset_all::<PathBuf>(&[])?;
        if !removed.is_empty() {
            info!("Removed {} segments left by a previous run", removed.len());
        }

        let snapshot = self.merger.snapshot_path();
        match std::fs::remove_file(snapshot) {
            Ok(()) => debug!("Removed stale snapshot {}", snapshot.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StorageError::Delete {
                    path: snapshot.to_path_buf(),
                    source,
                }
                .into())
            }
        }

        match self.inference.clear_stale_results() {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale classifier results", n),
            Err(e) => warn!(
                "Could not clear classifier output in {}: {}",
                self.inference.output_dir().display(),
                e
            ),
        }
        Ok(())
    }

    /// Runs cycles until shutdown.
    pub async fn run(&mut self, shutdown: Shutdown) {
        info!(
            "Capturing on {} into {}",
            self.capture.interfaces().join(", "),
            self.store.dir().display()
        );
        let thresholds = self.engine.thresholds();
        info!(
            "Alarm when probability > {} over at least {} packets",
            thresholds.ip_block_threshold, thresholds.min_packets_count
        );

        while !shutdown.is_triggered() {
            match self.run_cycle(&shutdown).await {
                CycleOutcome::Stopped => break,
                CycleOutcome::CaptureFailed => {
                    tokio::select! {
                        _ = tokio::time::sleep(CAPTURE_RETRY_DELAY) => {}
                        _ = shutdown.triggered() => break,
                    }
                }
                outcome => trace!("Cycle finished: {:?}", outcome),
            }
        }

        self.enter(SupervisorState::Stopped);
        info!("Capture loop stopped");
    }

    /// Runs one full cycle.
    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> CycleOutcome {
        self.enter(SupervisorState::Capturing);
        let segment = self.store.next_segment_path();
        match self.capture.capture_segment(&segment, shutdown).await {
            Ok(CaptureOutcome::Written) => Metrics::inc(&self.metrics.segments_captured),
            Ok(CaptureOutcome::Interrupted) => return CycleOutcome::Stopped,
            Err(e) => {
                warn!("Capture failed: {}", e);
                Metrics::inc(&self.metrics.capture_failures);
                return CycleOutcome::CaptureFailed;
            }
        }
        // The unit in flight is complete; that is all shutdown waits for.
        if shutdown.is_triggered() {
            return CycleOutcome::Stopped;
        }

        if self.pipeline.take_pending_reset() {
            self.enter(SupervisorState::Resetting);
            self.reset_except(&segment);
        }

        let outcome = self.analyze(shutdown).await;
        if outcome != CycleOutcome::Stopped {
            Metrics::inc(&self.metrics.cycles);
        }
        outcome
    }

    fn reset_except(&mut self, segment: &Path) {
        match self.retention.reset_all(&[segment]) {
            Ok(removed) => {
                Metrics::inc(&self.metrics.resets);
                info!(
                    "Discarded {} segments captured before the block",
                    removed.len()
                );
            }
            Err(e) => {
                warn!("Reset failed, retrying next cycle: {}", e);
                self.pipeline.request_reset();
            }
        }
    }

    async fn analyze(&mut self, shutdown: &Shutdown) -> CycleOutcome {
        self.enter(SupervisorState::Trimming);
        let segments = match self.store.list() {
            Ok(segments) => self.retention.trim(segments, self.max_retained),
            Err(e) => {
                warn!("{}", e);
                return CycleOutcome::NoSnapshot;
            }
        };

        self.enter(SupervisorState::Merging);
        let snapshot = match self.merger.merge(segments, shutdown).await {
            Ok(snapshot) => snapshot,
            Err(MergeError::Cancelled) => return CycleOutcome::Stopped,
            Err(e) => {
                warn!("Skipping cycle, snapshot not built: {}", e);
                Metrics::inc(&self.metrics.merge_failures);
                return CycleOutcome::NoSnapshot;
            }
        };

        self.enter(SupervisorState::Classifying);
        let verdict = match self.inference.run(&snapshot, shutdown).await {
            InferenceOutcome::Verdict(verdict) => verdict,
            InferenceOutcome::Cancelled => return CycleOutcome::Stopped,
            InferenceOutcome::TimedOut => {
                Metrics::inc(&self.metrics.inference_timeouts);
                return CycleOutcome::NoVerdict;
            }
            InferenceOutcome::NoOutput | InferenceOutcome::Failed(_) => {
                Metrics::inc(&self.metrics.inference_failures);
                return CycleOutcome::NoVerdict;
            }
        };
        self.metrics.record_verdict(verdict.ddos_probability);

        self.enter(SupervisorState::Deciding);
        let assessment = self.engine.handle_verdict(&verdict, &snapshot).await;
        CycleOutcome::Decided(assessment.decision)
    }
}
