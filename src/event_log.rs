//! Alert event log.
//!
//! Every alarm is recorded, whether or not the operator is notified. Records
//! go to a local JSON-lines file and, optionally, to a collector API that
//! accepts `POST <api_url>/api/logs/`. Sink failures are logged and never
//! interrupt the pipeline.

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::SecondsFormat;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::alerting::AlertEvent;
use crate::config::EventLogConfig;

/// Append-only destination for alert events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &AlertEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &AlertEvent) {}
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &AlertEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

impl EventSink for JsonLinesSink {
    fn record(&self, event: &AlertEvent) {
        match self.append(event) {
            Ok(()) => debug!("Recorded alert in {}", self.path.display()),
            Err(e) => warn!("Failed to append alert to {}: {}", self.path.display(), e),
        }
    }
}

/// Record format accepted by the log collector API.
#[derive(Debug, Serialize, PartialEq)]
pub struct CollectorRecord {
    pub ip: IpAddr,
    pub created_at: String,
    pub ddos_probability: f64,
    pub request_count: u64,
}

impl From<&AlertEvent> for CollectorRecord {
    fn from(event: &AlertEvent) -> Self {
        Self {
            ip: event.suspect_address,
            created_at: event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            ddos_probability: event.ddos_probability,
            request_count: event.request_count,
        }
    }
}

/// POSTs records to a log collector.
pub struct HttpSink {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpSink {
    pub fn new(api_url: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            endpoint: format!("{}/api/logs/", api_url.trim_end_matches('/')),
            http_client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EventSink for HttpSink {
    fn record(&self, event: &AlertEvent) {
        let request = self
            .http_client
            .post(&self.endpoint)
            .json(&CollectorRecord::from(event));
        let endpoint = self.endpoint.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, alert not posted to {}", endpoint);
            return;
        };

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Alert logged to {}", endpoint);
                }
                Ok(response) => {
                    warn!("Log collector returned {} from {}", response.status(), endpoint);
                }
                Err(e) => error!("Failed to post alert to {}: {}", endpoint, e),
            }
        });
    }
}

/// Fans an event out to several sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for CompositeSink {
    fn record(&self, event: &AlertEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Builds the sinks named in the configuration.
pub fn from_config(config: &EventLogConfig) -> Arc<dyn EventSink> {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(path) = &config.path {
        sinks.push(Arc::new(JsonLinesSink::new(path)));
    }
    if let Some(api_url) = &config.api_url {
        sinks.push(Arc::new(HttpSink::new(api_url)));
    }

    match sinks.len() {
        0 => Arc::new(NullSink),
        1 => sinks.remove(0),
        _ => Arc::new(CompositeSink::new(sinks)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event() -> AlertEvent {
        AlertEvent {
            suspect_address: "198.51.100.4".parse().unwrap(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            ddos_probability: 0.9,
            packet_count: 150,
            request_count: 97,
        }
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("alerts.jsonl"));

        sink.record(&event());
        sink.record(&event());

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["suspect_address"], "198.51.100.4");
        assert_eq!(parsed["packet_count"], 150);
        assert_eq!(parsed["request_count"], 97);
    }

    #[test]
    fn test_unwritable_sink_does_not_panic() {
        let sink = JsonLinesSink::new("/nonexistent/dir/alerts.jsonl");
        sink.record(&event());
    }

    #[test]
    fn test_collector_record_format() {
        let record = CollectorRecord::from(&event());
        assert_eq!(record.created_at, "2024-03-01T12:30:00.000000Z");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ip"], "198.51.100.4");
        assert_eq!(json["request_count"], 97);
    }

    #[test]
    fn test_http_sink_endpoint() {
        assert_eq!(
            HttpSink::new("http://collector:8000/").endpoint(),
            "http://collector:8000/api/logs/"
        );
    }

    #[test]
    fn test_composite_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let a: Arc<dyn EventSink> = Arc::new(JsonLinesSink::new(dir.path().join("a.jsonl")));
        let b: Arc<dyn EventSink> = Arc::new(JsonLinesSink::new(dir.path().join("b.jsonl")));
        let composite = CompositeSink::new(vec![a, b]);

        composite.record(&event());

        assert!(dir.path().join("a.jsonl").exists());
        assert!(dir.path().join("b.jsonl").exists());
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let sink = from_config(&EventLogConfig {
            path: Some(path.clone()),
            api_url: None,
        });
        sink.record(&event());
        assert!(path.exists());
    }
}
