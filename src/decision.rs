//! Alert decisions.
//!
//! [`decide`] maps a verdict onto one of three outcomes and has no side
//! effects. [`AlertDecisionEngine`] acts on the outcome: on an alarm it names
//! the suspect sender, records the event and notifies the operator.
//! [`RemediationListener`] applies the operator's answers as they arrive and
//! raises the pending-reset flag after a successful block.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alerting::{AlertEvent, AlertHandle, DecisionReceiver, Notifier, RemediationRequest};
use crate::config::DetectionConfig;
use crate::event_log::EventSink;
use crate::inference::VerdictRow;
use crate::metrics::{Metrics, SharedMetrics};
use crate::remediation::{RemediationChoice, Remediator};
use crate::senders::SenderFrequency;
use crate::shutdown::Shutdown;

/// Outcome of evaluating one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Too few packets for the verdict to be trusted
    InsufficientData,
    Safe,
    Alarm,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data"),
            Self::Safe => write!(f, "safe"),
            Self::Alarm => write!(f, "alarm"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_packets_count: u64,
    pub ip_block_threshold: f64,
}

impl From<&DetectionConfig> for Thresholds {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            min_packets_count: config.min_packets_count,
            ip_block_threshold: config.ip_block_threshold,
        }
    }
}

/// Classifies a verdict. The packet floor is checked first, so a verdict
/// over too few packets is never an alarm, whatever its probability.
pub fn decide(packet_count: u64, ddos_probability: f64, thresholds: &Thresholds) -> Decision {
    if packet_count < thresholds.min_packets_count {
        Decision::InsufficientData
    } else if ddos_probability > thresholds.ip_block_threshold {
        Decision::Alarm
    } else {
        Decision::Safe
    }
}

impl Decision {
    pub fn for_verdict(verdict: &VerdictRow, thresholds: &Thresholds) -> Self {
        decide(verdict.packet_count, verdict.ddos_probability, thresholds)
    }
}

/// Process-wide pipeline flags shared between the capture loop and the
/// remediation listener.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pending_reset: Arc<AtomicBool>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the next capture cycle to purge older segments.
    pub fn request_reset(&self) {
        self.pending_reset.store(true, Ordering::SeqCst);
    }

    pub fn is_reset_pending(&self) -> bool {
        self.pending_reset.load(Ordering::SeqCst)
    }

    /// Returns true once per requested reset, clearing the flag.
    pub fn take_pending_reset(&self) -> bool {
        self.pending_reset.swap(false, Ordering::SeqCst)
    }
}

/// What the engine did about an alarm.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmAction {
    /// The operator was notified.
    Notified { handle: AlertHandle, event: AlertEvent },
    /// The suspect is allow-listed; the event was recorded only.
    Suppressed(AlertEvent),
    /// The snapshot holds no non-local sender to blame.
    NoSuspect,
}

/// Result of handling one verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub decision: Decision,
    pub action: Option<AlarmAction>,
}

/// Acts on verdicts through injected collaborators.
pub struct AlertDecisionEngine {
    thresholds: Thresholds,
    local_addresses: Arc<HashSet<IpAddr>>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
    remediator: Arc<dyn Remediator>,
    metrics: SharedMetrics,
}

impl AlertDecisionEngine {
    pub fn new(
        thresholds: Thresholds,
        local_addresses: HashSet<IpAddr>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        remediator: Arc<dyn Remediator>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            thresholds,
            local_addresses: Arc::new(local_addresses),
            notifier,
            sink,
            remediator,
            metrics,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Decides on `verdict` and, on an alarm, reports the suspect found in
    /// `snapshot`.
    pub async fn handle_verdict(&self, verdict: &VerdictRow, snapshot: &Path) -> Assessment {
        let decision = Decision::for_verdict(verdict, &self.thresholds);
        self.metrics.record_decision(decision);

        let action = match decision {
            Decision::InsufficientData => {
                info!(
                    "Not enough packets to trust the verdict ({} < {}), DDoS probability {}",
                    verdict.packet_count,
                    self.thresholds.min_packets_count,
                    verdict.probability_pretty()
                );
                None
            }
            Decision::Safe => {
                info!(
                    "No DDoS detected: probability {} over {} packets",
                    verdict.probability_pretty(),
                    verdict.packet_count
                );
                None
            }
            Decision::Alarm => {
                warn!(
                    "DDoS attack likely: probability {} over {} packets",
                    verdict.probability_pretty(),
                    verdict.packet_count
                );
                Some(self.raise_alarm(verdict, snapshot).await)
            }
        };

        Assessment { decision, action }
    }

    async fn raise_alarm(&self, verdict: &VerdictRow, snapshot: &Path) -> AlarmAction {
        let path: PathBuf = snapshot.to_path_buf();
        let local = Arc::clone(&self.local_addresses);
        let counted =
            tokio::task::spawn_blocking(move || SenderFrequency::from_pcap(&path, &local)).await;

        let frequency = match counted {
            Ok(Ok(frequency)) => frequency,
            Ok(Err(e)) => {
                warn!("Cannot determine suspect sender: {:#}", e);
                return AlarmAction::NoSuspect;
            }
            Err(e) => {
                warn!("Sender analysis task failed: {}", e);
                return AlarmAction::NoSuspect;
            }
        };

        let Some(suspect) = frequency.most_frequent() else {
            warn!("Alarm raised but the snapshot has no non-local sender");
            return AlarmAction::NoSuspect;
        };

        let event = AlertEvent {
            suspect_address: suspect.address,
            timestamp: Utc::now(),
            ddos_probability: verdict.ddos_probability,
            packet_count: verdict.packet_count,
            request_count: suspect.count,
        };
        self.sink.record(&event);

        if self.remediator.whitelist_contains(suspect.address) {
            info!(
                "Suspect {} is allow-listed, alert recorded but not sent",
                suspect.address
            );
            Metrics::inc(&self.metrics.alerts_suppressed);
            return AlarmAction::Suppressed(event);
        }

        let context = format!(
            "Model {} over {} ({} packets, {} samples); {} sent {} of them",
            verdict.model,
            verdict.source,
            verdict.packet_count,
            verdict.sample_count,
            suspect.address,
            suspect.count
        );
        let handle = self.notifier.notify_alert(&event, &context);
        Metrics::inc(&self.metrics.alerts_sent);
        debug!("Alert {} sent for {}", handle, suspect.address);

        AlarmAction::Notified { handle, event }
    }
}

/// Applies operator answers to alerts.
pub struct RemediationListener {
    remediator: Arc<dyn Remediator>,
    state: PipelineState,
    metrics: SharedMetrics,
}

impl RemediationListener {
    pub fn new(
        remediator: Arc<dyn Remediator>,
        state: PipelineState,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            remediator,
            state,
            metrics,
        }
    }

    /// Applies answers until the channel closes or shutdown is triggered.
    pub async fn run(self, mut decisions: DecisionReceiver, shutdown: Shutdown) {
        loop {
            tokio::select! {
                request = decisions.recv() => match request {
                    Some(request) => {
                        self.apply(request).await;
                    }
                    None => break,
                },
                _ = shutdown.triggered() => break,
            }
        }
        debug!("Remediation listener stopped");
    }

    /// Applies one answer. Returns true if the action succeeded.
    pub async fn apply(&self, request: RemediationRequest) -> bool {
        let RemediationRequest {
            handle,
            address,
            choice,
        } = request;
        info!("Alert {}: operator chose '{}' for {}", handle, choice, address);

        let remediator = Arc::clone(&self.remediator);
        let applied = tokio::task::spawn_blocking(move || match choice {
            RemediationChoice::Block => remediator.block(address),
            RemediationChoice::Whitelist => match remediator.whitelist_add(address) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}", e);
                    false
                }
            },
        })
        .await
        .unwrap_or(false);

        match (choice, applied) {
            (RemediationChoice::Block, true) => {
                Metrics::inc(&self.metrics.blocks);
                self.state.request_reset();
                info!(
                    "{} blocked; segments captured before the block will be discarded",
                    address
                );
            }
            (RemediationChoice::Whitelist, true) => {
                Metrics::inc(&self.metrics.whitelisted);
            }
            (_, false) => warn!("Could not apply '{}' to {}", choice, address),
        }
        applied
    }
}
