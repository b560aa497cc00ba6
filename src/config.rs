//! Configuration Module
//!
//! Provides TOML-based configuration for DDoS Watch. The configuration is
//! loaded once at startup, validated, and then shared read-only with every
//! component. CLI arguments can override a few file settings.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::alerting::WebhookConfig;
use crate::remediation::{FirewallBackend, RemediationChoice};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub retention: RetentionConfig,
    pub merge: MergeConfig,
    pub inference: InferenceConfig,
    pub detection: DetectionConfig,
    pub remediation: RemediationConfig,
    pub notification: NotificationConfig,
    pub event_log: EventLogConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads configuration from file if given, otherwise returns defaults.
    ///
    /// Unlike a missing path, a file that exists but cannot be parsed is an
    /// error: running with silently different thresholds is worse than not
    /// running at all.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                tracing::debug!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.retention.max_retained_segments == 0 {
            anyhow::bail!("max_retained_segments must be greater than 0");
        }
        let threshold = self.detection.ip_block_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            anyhow::bail!("ip_block_threshold must be between 0.0 and 1.0 (exclusive)");
        }
        if self.inference.timeout_secs == 0 {
            anyhow::bail!("inference timeout_secs must be greater than 0");
        }
        if self.inference.poll_interval_ms == 0 {
            anyhow::bail!("inference poll_interval_ms must be greater than 0");
        }
        if self.capture.packets_per_segment == 0 {
            anyhow::bail!("packets_per_segment must be greater than 0");
        }
        if self.capture.segment_prefix.is_empty() {
            anyhow::bail!("segment_prefix must not be empty");
        }
        if self.merge.snapshot_name.starts_with(&self.capture.segment_prefix) {
            anyhow::bail!(
                "snapshot_name '{}' must not start with the segment prefix '{}'",
                self.merge.snapshot_name,
                self.capture.segment_prefix
            );
        }
        for (name, value) in [
            ("capture_tool", &self.capture.capture_tool),
            ("merge_tool", &self.merge.merge_tool),
            ("classifier", &self.inference.classifier),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }
        if self.notification.kind == NotifierKind::Webhook && self.notification.webhook.is_none() {
            anyhow::bail!("notification kind 'webhook' requires a [notification.webhook] section");
        }
        Ok(())
    }

    /// Full path of the cumulative snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.capture.segment_dir.join(&self.merge.snapshot_name)
    }
}

/// Capture-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interfaces to capture on (empty = pcap default device)
    pub interfaces: Vec<String>,
    /// Capture tool invoked once per segment
    pub capture_tool: String,
    /// Directory holding capture segments and the merged snapshot
    pub segment_dir: PathBuf,
    /// File name prefix shared by all segments
    pub segment_prefix: String,
    /// Packets written into each segment
    pub packets_per_segment: u32,
    /// Time the capture tool gets to finish its unit on shutdown
    pub shutdown_grace_ms: u64,
    /// Refuse to start unless running as root (unix only)
    pub require_root: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            capture_tool: "tshark".to_string(),
            segment_dir: std::env::temp_dir().join("ddos-watch"),
            segment_prefix: "capture".to_string(),
            packets_per_segment: 1,
            shutdown_grace_ms: 2_000,
            require_root: true,
        }
    }
}

/// Segment retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Most recent segments kept for merging
    pub max_retained_segments: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_retained_segments: 7,
        }
    }
}

/// Snapshot merge configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Packet merge tool
    pub merge_tool: String,
    /// File name of the merged snapshot inside the segment directory
    pub snapshot_name: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_tool: "mergecap".to_string(),
            snapshot_name: "merged.pcap".to_string(),
        }
    }
}

/// Classifier invocation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Classifier executable
    pub classifier: String,
    /// Arguments placed before `--predict_live` (e.g. an interpreter script)
    pub classifier_args: Vec<String>,
    /// Trained model artifact passed with `--model`
    pub model_path: PathBuf,
    /// Directory the classifier writes its CSV results to
    pub output_dir: PathBuf,
    /// Seconds allowed between the result file appearing and it holding a data row
    pub timeout_secs: u64,
    /// Upper bound on waiting for the result file to appear at all
    pub launch_timeout_secs: Option<u64>,
    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
}

impl InferenceConfig {
    /// Effective bound on waiting for the result file to appear.
    pub fn launch_timeout_secs(&self) -> u64 {
        self.launch_timeout_secs
            .unwrap_or_else(|| self.timeout_secs.saturating_mul(10))
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            classifier: "lucid_cnn".to_string(),
            classifier_args: Vec::new(),
            model_path: PathBuf::from("model/10t-10n-DOS2019-LUCID.h5"),
            output_dir: PathBuf::from("output"),
            timeout_secs: 30,
            launch_timeout_secs: None,
            poll_interval_ms: 100,
        }
    }
}

/// Detection thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Verdicts over fewer packets are not trusted
    pub min_packets_count: u64,
    /// Probability above which an alarm is raised
    pub ip_block_threshold: f64,
    /// Extra addresses treated as this host (added to interface addresses)
    pub local_addresses: Vec<IpAddr>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_packets_count: 100,
            ip_block_threshold: 0.8,
            local_addresses: Vec::new(),
        }
    }
}

/// Remediation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Firewall used to block confirmed attackers
    pub firewall: FirewallBackend,
    /// Allow-list file, one address per line
    pub whitelist_path: PathBuf,
    /// Answer every alert with this choice instead of asking an operator
    pub auto_decision: Option<RemediationChoice>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            firewall: FirewallBackend::default(),
            whitelist_path: PathBuf::from("whitelist.txt"),
            auto_decision: None,
        }
    }
}

/// How operators are told about alarms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// Print the alert and read the answer from stdin
    #[default]
    Console,
    /// POST the alert to a webhook
    Webhook,
    /// Log only
    None,
}

impl std::fmt::Display for NotifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Console => write!(f, "console"),
            Self::Webhook => write!(f, "webhook"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub kind: NotifierKind,
    pub webhook: Option<WebhookConfig>,
}

/// Alert event log configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// JSON-lines file receiving one record per alert
    pub path: Option<PathBuf>,
    /// Base URL of a log collector (records are POSTed to `<api_url>/api/logs/`)
    pub api_url: Option<String>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("alerts.jsonl")),
            api_url: None,
        }
    }
}

/// Prometheus endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); RUST_LOG wins if set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.capture.capture_tool, "tshark");
        assert_eq!(config.merge.merge_tool, "mergecap");
        assert_eq!(config.inference.poll_interval_ms, 100);
        assert_eq!(config.retention.max_retained_segments, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate() {
        let mut config = Config::default();
        config.retention.max_retained_segments = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.ip_block_threshold = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.ip_block_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.ip_block_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.merge.merge_tool = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.notification.kind = NotifierKind::Webhook;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_is_rejected() {
        let config: Config = toml::from_str("[detection]\nip_block_threshold = nan").unwrap();
        assert!(config.detection.ip_block_threshold.is_nan());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_snapshot_must_not_look_like_a_segment() {
        let mut config = Config::default();
        config.merge.snapshot_name = "capture_merged.pcap".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_launch_timeout_defaults_to_multiple_of_timeout() {
        let mut config = InferenceConfig::default();
        config.timeout_secs = 5;
        assert_eq!(config.launch_timeout_secs(), 50);
        config.launch_timeout_secs = Some(7);
        assert_eq!(config.launch_timeout_secs(), 7);
    }

    #[test]
    fn test_generate_default_config() {
        let config_str = Config::generate_default();
        assert!(config_str.contains("[capture]"));
        assert!(config_str.contains("[retention]"));
        assert!(config_str.contains("[inference]"));
        assert!(config_str.contains("[detection]"));
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[capture]
interfaces = ["eth0", "eth1"]
segment_dir = "/var/tmp/watch"

[retention]
max_retained_segments = 7

[inference]
classifier = "python3"
classifier_args = ["lucid/lucid_cnn.py"]
timeout_secs = 15

[detection]
min_packets_count = 50
ip_block_threshold = 0.8
local_addresses = ["192.168.1.10"]

[remediation]
firewall = "none"
auto_decision = "block"

[notification]
kind = "webhook"

[notification.webhook]
url = "http://localhost:8080/hook"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capture.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(config.capture.segment_dir, PathBuf::from("/var/tmp/watch"));
        assert_eq!(config.retention.max_retained_segments, 7);
        assert_eq!(config.inference.classifier_args, vec!["lucid/lucid_cnn.py"]);
        assert_eq!(config.inference.timeout_secs, 15);
        assert_eq!(config.detection.min_packets_count, 50);
        assert_eq!(
            config.detection.local_addresses,
            vec!["192.168.1.10".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(config.remediation.firewall, FirewallBackend::None);
        assert_eq!(config.remediation.auto_decision, Some(RemediationChoice::Block));
        assert_eq!(config.notification.kind, NotifierKind::Webhook);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/var/tmp/watch/merged.pcap")
        );
    }
}
