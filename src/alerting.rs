//! Alerting module for operator notifications.
//!
//! An alarm is delivered to a [`Notifier`], which returns an [`AlertHandle`]
//! immediately. The operator's answer (block or whitelist) comes back later
//! as a [`RemediationRequest`] on the decision channel, keyed by that handle.
//! The pipeline never waits for it.

use std::collections::{HashMap, VecDeque};
use std::io::BufRead;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::remediation::RemediationChoice;

/// An alarm raised against one suspect sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub suspect_address: IpAddr,
    pub timestamp: DateTime<Utc>,
    /// Classifier probability in [0, 1]
    pub ddos_probability: f64,
    /// Packets in the classified snapshot
    pub packet_count: u64,
    /// Packets sent by the suspect within the snapshot
    pub request_count: u64,
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DDoS suspected from {} (probability {:.1}%, {} of {} packets)",
            self.suspect_address,
            self.ddos_probability * 100.0,
            self.request_count,
            self.packet_count
        )
    }
}

/// Identifies one delivered alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AlertHandle(pub u64);

impl std::fmt::Display for AlertHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The operator's answer to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationRequest {
    pub handle: AlertHandle,
    pub address: IpAddr,
    pub choice: RemediationChoice,
}

pub type DecisionSender = mpsc::UnboundedSender<RemediationRequest>;
pub type DecisionReceiver = mpsc::UnboundedReceiver<RemediationRequest>;

/// Creates the channel carrying operator answers back to the pipeline.
pub fn decision_channel() -> (DecisionSender, DecisionReceiver) {
    mpsc::unbounded_channel()
}

/// Hands out increasing alert handles.
#[derive(Debug, Default)]
pub struct HandleCounter {
    next: AtomicU64,
}

impl HandleCounter {
    pub fn next(&self) -> AlertHandle {
        AlertHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Delivers alarms to an operator.
pub trait Notifier: Send + Sync {
    /// Delivers `event` and returns without waiting for an answer.
    fn notify_alert(&self, event: &AlertEvent, context: &str) -> AlertHandle;
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier {
    handles: HandleCounter,
}

impl Notifier for LogNotifier {
    fn notify_alert(&self, event: &AlertEvent, context: &str) -> AlertHandle {
        let handle = self.handles.next();
        warn!("Alert {}: {} [{}]", handle, event, context);
        handle
    }
}

/// Prints alerts to stdout and reads answers from stdin.
///
/// An answer is `block` or `whitelist`, optionally followed by the alert
/// number; without a number it applies to the oldest unanswered alert.
#[derive(Debug, Default)]
pub struct ConsoleNotifier {
    handles: HandleCounter,
    pending: Arc<Mutex<PendingAlerts>>,
}

/// Alerts awaiting an operator answer, oldest first.
#[derive(Debug, Default)]
pub struct PendingAlerts {
    order: VecDeque<AlertHandle>,
    addresses: HashMap<AlertHandle, IpAddr>,
}

impl PendingAlerts {
    pub fn insert(&mut self, handle: AlertHandle, address: IpAddr) {
        self.order.push_back(handle);
        self.addresses.insert(handle, address);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Parses one answer line and removes the alert it resolves.
    pub fn answer(&mut self, line: &str) -> Result<RemediationRequest, String> {
        let mut words = line.split_whitespace();
        let choice: RemediationChoice = words
            .next()
            .ok_or_else(|| "empty answer".to_string())?
            .parse()?;

        let handle = match words.next() {
            Some(word) => {
                let number = word
                    .trim_start_matches('#')
                    .parse::<u64>()
                    .map_err(|_| format!("invalid alert number '{}'", word))?;
                AlertHandle(number)
            }
            None => *self
                .order
                .front()
                .ok_or_else(|| "no alert is waiting for an answer".to_string())?,
        };

        let address = self
            .addresses
            .remove(&handle)
            .ok_or_else(|| format!("alert {} is not waiting for an answer", handle))?;
        self.order.retain(|h| *h != handle);

        Ok(RemediationRequest {
            handle,
            address,
            choice,
        })
    }
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts reading operator answers from stdin on a dedicated thread.
    ///
    /// A plain thread is used so a pending read never holds up runtime
    /// shutdown. It ends at EOF or once the decision receiver is gone.
    pub fn listen(&self, decisions: DecisionSender) {
        let pending = Arc::clone(&self.pending);
        let spawned = std::thread::Builder::new()
            .name("console-answers".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let answer = pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .answer(&line);
                    match answer {
                        Ok(request) => {
                            if decisions.send(request).is_err() {
                                break;
                            }
                        }
                        Err(reason) => println!(
                            "Cannot apply '{}': {} (answer 'block [N]' or 'whitelist [N]')",
                            line.trim(),
                            reason
                        ),
                    }
                }
                debug!("Console answer reader finished");
            });

        if let Err(e) = spawned {
            error!("Failed to start console answer reader: {}", e);
        }
    }
}

impl Notifier for ConsoleNotifier {
    fn notify_alert(&self, event: &AlertEvent, context: &str) -> AlertHandle {
        let handle = self.handles.next();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, event.suspect_address);

        println!();
        println!("ALERT {}: {}", handle, event);
        println!("  {}", context);
        println!(
            "  Answer 'block {}' to block {} or 'whitelist {}' to trust it.",
            handle.0, event.suspect_address, handle.0
        );
        handle
    }
}

/// Configuration for a webhook destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL.
    pub url: String,
    /// Optional custom headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Alert payload sent to webhooks.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    handle: AlertHandle,
    #[serde(flatten)]
    event: &'a AlertEvent,
    context: &'a str,
    choices: [RemediationChoice; 2],
}

/// POSTs alerts to a webhook.
///
/// Delivery is fire-and-forget: failures are logged, never retried.
pub struct WebhookNotifier {
    config: WebhookConfig,
    http_client: reqwest::Client,
    handles: HandleCounter,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        info!("Alerts will be posted to {}", config.url);

        Self {
            config,
            http_client,
            handles: HandleCounter::default(),
        }
    }

    fn request(&self, payload: &WebhookPayload<'_>) -> reqwest::RequestBuilder {
        let mut request = self.http_client.post(&self.config.url).json(payload);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        request
    }
}

impl Notifier for WebhookNotifier {
    fn notify_alert(&self, event: &AlertEvent, context: &str) -> AlertHandle {
        let handle = self.handles.next();
        let payload = WebhookPayload {
            handle,
            event,
            context,
            choices: [RemediationChoice::Block, RemediationChoice::Whitelist],
        };
        let request = self.request(&payload);
        let url = self.config.url.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, alert {} not posted to {}", handle, url);
            return handle;
        };

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Webhook sent successfully to {}", url);
                }
                Ok(response) => {
                    warn!("Webhook returned error status {} from {}", response.status(), url);
                }
                Err(e) => {
                    error!("Failed to send webhook to {}: {}", url, e);
                }
            }
        });

        handle
    }
}

/// Answers every alert with a fixed choice, on top of another notifier.
pub struct AutoDecisionNotifier {
    inner: Arc<dyn Notifier>,
    choice: RemediationChoice,
    decisions: DecisionSender,
}

impl AutoDecisionNotifier {
    pub fn new(
        inner: Arc<dyn Notifier>,
        choice: RemediationChoice,
        decisions: DecisionSender,
    ) -> Self {
        Self {
            inner,
            choice,
            decisions,
        }
    }
}

impl Notifier for AutoDecisionNotifier {
    fn notify_alert(&self, event: &AlertEvent, context: &str) -> AlertHandle {
        let handle = self.inner.notify_alert(event, context);
        info!(
            "Automatically answering alert {} with '{}'",
            handle, self.choice
        );
        let request = RemediationRequest {
            handle,
            address: event.suspect_address,
            choice: self.choice,
        };
        if self.decisions.send(request).is_err() {
            warn!("Decision channel closed, alert {} left unanswered", handle);
        }
        handle
    }
}
