//! External classifier invocation.
//!
//! The classifier is an opaque executable run once per snapshot:
//!
//! ```text
//! <classifier> [args] --predict_live <snapshot> --model <model>
//! ```
//!
//! It writes one CSV file into a fixed output directory, and it creates that
//! file before it has finished writing it. We therefore poll: first for a
//! result file that was not there before launch, then for that file to hold
//! a complete data row. The timeout clock starts when the file is first
//! seen, not at launch. Either way the classifier is killed afterwards, since
//! it may otherwise keep running indefinitely.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::InferenceConfig;
use crate::error::VerdictParseError;
use crate::shutdown::Shutdown;
use crate::subprocess::ManagedChild;

const RESULT_EXTENSION: &str = "csv";

/// The classifier's structured output for one snapshot.
///
/// Metric columns are `N/A` in live prediction mode and parse to `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictRow {
    pub model: String,
    pub elapsed_time: Option<f64>,
    pub packet_count: u64,
    pub sample_count: u64,
    pub ddos_probability: f64,
    pub accuracy: Option<f64>,
    pub f1: Option<f64>,
    pub tpr: Option<f64>,
    pub fpr: Option<f64>,
    pub tnr: Option<f64>,
    pub fnr: Option<f64>,
    pub source: String,
}

impl VerdictRow {
    /// Parses the first data row of a classifier CSV. Later rows are ignored.
    pub fn from_csv(content: &str) -> Result<Self, VerdictParseError> {
        let mut lines = content.lines().filter(|line| !line.trim().is_empty());
        let header = lines.next().ok_or(VerdictParseError::MissingHeader)?;
        let row = lines.next().ok_or(VerdictParseError::MissingRow)?;

        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let values: Vec<&str> = row.split(',').map(str::trim).collect();

        let field = |name: &'static str| -> Result<&str, VerdictParseError> {
            columns
                .iter()
                .position(|c| *c == name)
                .and_then(|i| values.get(i).copied())
                .ok_or(VerdictParseError::MissingColumn(name))
        };

        let ddos_probability = parse_f64("DDOS%", field("DDOS%")?)?;
        if !(0.0..=1.0).contains(&ddos_probability) {
            return Err(VerdictParseError::InvalidNumber {
                column: "DDOS%",
                value: ddos_probability.to_string(),
            });
        }

        Ok(Self {
            model: field("Model")?.to_string(),
            elapsed_time: parse_metric("Time", field("Time")?)?,
            packet_count: parse_count("Packets", field("Packets")?)?,
            sample_count: parse_count("Samples", field("Samples")?)?,
            ddos_probability,
            accuracy: parse_metric("Accuracy", field("Accuracy")?)?,
            f1: parse_metric("F1Score", field("F1Score")?)?,
            tpr: parse_metric("TPR", field("TPR")?)?,
            fpr: parse_metric("FPR", field("FPR")?)?,
            tnr: parse_metric("TNR", field("TNR")?)?,
            fnr: parse_metric("FNR", field("FNR")?)?,
            source: field("Source")?.to_string(),
        })
    }

    /// Probability formatted for humans, e.g. `95.0%`.
    pub fn probability_pretty(&self) -> String {
        format!("{:.1}%", self.ddos_probability * 100.0)
    }
}

fn parse_f64(column: &'static str, value: &str) -> Result<f64, VerdictParseError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| VerdictParseError::InvalidNumber {
            column,
            value: value.to_string(),
        })
}

fn parse_metric(column: &'static str, value: &str) -> Result<Option<f64>, VerdictParseError> {
    if value.is_empty() || value.eq_ignore_ascii_case("n/a") {
        return Ok(None);
    }
    parse_f64(column, value).map(Some)
}

fn parse_count(column: &'static str, value: &str) -> Result<u64, VerdictParseError> {
    if let Ok(count) = value.parse::<u64>() {
        return Ok(count);
    }
    // Some exporters write counts as floats ("110.0").
    match parse_f64(column, value)? {
        v if v >= 0.0 && v.fract() == 0.0 => Ok(v as u64),
        _ => Err(VerdictParseError::InvalidNumber {
            column,
            value: value.to_string(),
        }),
    }
}

/// What happened to one classifier run.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    /// A data row was produced and parsed.
    Verdict(VerdictRow),
    /// The result file never got a data row within the timeout, or never
    /// appeared within the launch bound.
    TimedOut,
    /// The classifier exited without producing a usable result.
    NoOutput,
    /// Shutdown was requested while waiting.
    Cancelled,
    /// The classifier could not be run or its output could not be read.
    Failed(String),
}

impl InferenceOutcome {
    pub fn into_verdict(self) -> Option<VerdictRow> {
        match self {
            Self::Verdict(row) => Some(row),
            _ => None,
        }
    }
}

/// Runs the classifier against snapshots.
#[derive(Debug, Clone)]
pub struct InferenceInvoker {
    classifier: String,
    classifier_args: Vec<String>,
    model_path: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
    launch_timeout: Duration,
    poll_interval: Duration,
}

impl InferenceInvoker {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            classifier: config.classifier.clone(),
            classifier_args: config.classifier_args.clone(),
            model_path: config.model_path.clone(),
            output_dir: config.output_dir.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            launch_timeout: Duration::from_secs(config.launch_timeout_secs()),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Removes result files left behind by earlier runs.
    pub fn clear_stale_results(&self) -> std::io::Result<usize> {
        if !self.output_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for name in self.result_files()? {
            match std::fs::remove_file(self.output_dir.join(&name)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Classifies `snapshot`. Returns `None` when no verdict was produced.
    pub async fn classify(&self, snapshot: &Path, shutdown: &Shutdown) -> Option<VerdictRow> {
        self.run(snapshot, shutdown).await.into_verdict()
    }

    /// Classifies `snapshot`, reporting why no verdict was produced if so.
    pub async fn run(&self, snapshot: &Path, shutdown: &Shutdown) -> InferenceOutcome {
        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            return InferenceOutcome::Failed(format!(
                "cannot create {}: {}",
                self.output_dir.display(),
                e
            ));
        }

        let before = match self.result_files() {
            Ok(files) => files,
            Err(e) => return InferenceOutcome::Failed(format!("cannot list results: {}", e)),
        };

        let args = self
            .classifier_args
            .iter()
            .map(OsString::from)
            .chain([
                OsString::from("--predict_live"),
                snapshot.as_os_str().to_os_string(),
                OsString::from("--model"),
                self.model_path.as_os_str().to_os_string(),
            ]);

        let mut child = match ManagedChild::spawn("classifier", &self.classifier, args) {
            Ok(child) => child,
            Err(e) => {
                return InferenceOutcome::Failed(format!(
                    "failed to launch {}: {}",
                    self.classifier, e
                ))
            }
        };

        debug!("Asked classifier to analyze {}", snapshot.display());

        let (outcome, result_file) = self.poll(&mut child, &before, shutdown).await;

        if let Err(e) = child.terminate().await {
            warn!("Failed to terminate classifier: {}", e);
        }

        if let Some(path) = result_file {
            if let Err(e) = std::fs::remove_file(&path) {
                trace!("Could not remove {}: {}", path.display(), e);
            }
        }

        match &outcome {
            InferenceOutcome::TimedOut => {
                info!("Classifier took too long to produce a verdict, terminated it")
            }
            InferenceOutcome::NoOutput => warn!("Classifier exited without a verdict"),
            InferenceOutcome::Failed(reason) => warn!("Classification failed: {}", reason),
            InferenceOutcome::Cancelled => debug!("Classification cancelled"),
            InferenceOutcome::Verdict(_) => {}
        }

        outcome
    }

    async fn poll(
        &self,
        child: &mut ManagedChild,
        before: &HashSet<OsString>,
        shutdown: &Shutdown,
    ) -> (InferenceOutcome, Option<PathBuf>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let launched = Instant::now();
        let mut observed: Option<(PathBuf, Instant)> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.triggered() => {
                    return (InferenceOutcome::Cancelled, observed.map(|(path, _)| path));
                }
            }

            let exited = matches!(child.try_wait(), Ok(Some(_)));

            let (path, seen_at) = match &observed {
                Some((path, seen_at)) => (path.clone(), *seen_at),
                None => match self.new_result_file(before) {
                    Some(path) => {
                        debug!(
                            "Result file {} appeared, waiting for a data row",
                            path.display()
                        );
                        let seen_at = Instant::now();
                        observed = Some((path.clone(), seen_at));
                        (path, seen_at)
                    }
                    None if exited => return (InferenceOutcome::NoOutput, None),
                    None if launched.elapsed() >= self.launch_timeout => {
                        return (InferenceOutcome::TimedOut, None)
                    }
                    // Not visible yet; the next tick retries.
                    None => continue,
                },
            };

            match complete_lines(&path) {
                Ok((count, content)) if count > 1 => {
                    let outcome = match VerdictRow::from_csv(&content) {
                        Ok(row) => InferenceOutcome::Verdict(row),
                        Err(e) => InferenceOutcome::Failed(format!(
                            "unreadable result {}: {}",
                            path.display(),
                            e
                        )),
                    };
                    return (outcome, Some(path));
                }
                Ok(_) => {}
                Err(e) => trace!("Result file not readable yet: {}", e),
            }

            if exited {
                return (InferenceOutcome::NoOutput, Some(path));
            }
            if seen_at.elapsed() >= self.timeout {
                return (InferenceOutcome::TimedOut, Some(path));
            }
        }
    }

    fn result_files(&self) -> std::io::Result<HashSet<OsString>> {
        let mut files = HashSet::new();
        for entry in std::fs::read_dir(&self.output_dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RESULT_EXTENSION) {
                files.insert(entry.file_name());
            }
        }
        Ok(files)
    }

    fn new_result_file(&self, before: &HashSet<OsString>) -> Option<PathBuf> {
        let current = self.result_files().ok()?;
        let mut fresh: Vec<&OsString> = current.difference(before).collect();
        fresh.sort();
        fresh.first().map(|name| self.output_dir.join(name))
    }
}

/// Reads `path` and returns the number of newline-terminated lines together
/// with the content up to the last newline. A row still being written is
/// not counted.
fn complete_lines(path: &Path) -> std::io::Result<(usize, String)> {
    let content = std::fs::read_to_string(path)?;
    let complete = match content.rfind('\n') {
        Some(end) => &content[..=end],
        None => "",
    };
    let count = complete.lines().filter(|l| !l.trim().is_empty()).count();
    Ok((count, complete.to_string()))
}
