//! Prometheus Metrics Export Module
//!
//! Exposes pipeline counters in Prometheus text format over a minimal HTTP
//! endpoint that can be scraped by Prometheus.
//!
//! # Metrics Exported
//!
//! - `ddos_watch_segments_captured_total` - Capture units written
//! - `ddos_watch_capture_failures_total` - Capture tool failures
//! - `ddos_watch_cycles_total` - Pipeline iterations completed
//! - `ddos_watch_merge_failures_total` - Snapshots that could not be built
//! - `ddos_watch_verdicts_total` - Classifier verdicts received
//! - `ddos_watch_inference_timeouts_total` - Classifier runs that timed out
//! - `ddos_watch_inference_failures_total` - Classifier runs that failed otherwise
//! - `ddos_watch_decisions_total{decision}` - Decisions by outcome
//! - `ddos_watch_alerts_sent_total` - Alerts delivered to the operator
//! - `ddos_watch_alerts_suppressed_total` - Alarms against allow-listed senders
//! - `ddos_watch_blocks_total` - Addresses blocked
//! - `ddos_watch_resets_total` - Segment purges after a block
//! - `ddos_watch_last_ddos_probability` - Probability of the latest verdict

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::MetricsConfig;
use crate::decision::Decision;
use crate::shutdown::Shutdown;

const METRICS_PATH: &str = "/metrics";

/// Atomic metrics counters for thread-safe updates.
#[derive(Debug, Default)]
pub struct Metrics {
    pub segments_captured: AtomicU64,
    pub capture_failures: AtomicU64,
    pub cycles: AtomicU64,
    pub merge_failures: AtomicU64,
    pub verdicts: AtomicU64,
    pub inference_timeouts: AtomicU64,
    pub inference_failures: AtomicU64,
    pub decisions_insufficient: AtomicU64,
    pub decisions_safe: AtomicU64,
    pub decisions_alarm: AtomicU64,
    pub alerts_sent: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub blocks: AtomicU64,
    pub whitelisted: AtomicU64,
    pub resets: AtomicU64,
    /// f64 bit pattern of the latest verdict probability
    last_probability_bits: AtomicU64,
}

impl Metrics {
    /// Create new metrics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Counts a verdict and remembers its probability.
    pub fn record_verdict(&self, ddos_probability: f64) {
        Self::inc(&self.verdicts);
        self.last_probability_bits
            .store(ddos_probability.to_bits(), Ordering::Relaxed);
    }

    pub fn last_probability(&self) -> f64 {
        f64::from_bits(self.last_probability_bits.load(Ordering::Relaxed))
    }

    pub fn record_decision(&self, decision: Decision) {
        let counter = match decision {
            Decision::InsufficientData => &self.decisions_insufficient,
            Decision::Safe => &self.decisions_safe,
            Decision::Alarm => &self.decisions_alarm,
        };
        Self::inc(counter);
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &AtomicU64); 12] = [
            ("segments_captured_total", "Capture units written", &self.segments_captured),
            ("capture_failures_total", "Capture tool failures", &self.capture_failures),
            ("cycles_total", "Pipeline iterations completed", &self.cycles),
            ("merge_failures_total", "Snapshots that could not be built", &self.merge_failures),
            ("verdicts_total", "Classifier verdicts received", &self.verdicts),
            (
                "inference_timeouts_total",
                "Classifier runs that timed out",
                &self.inference_timeouts,
            ),
            ("inference_failures_total", "Classifier runs that failed", &self.inference_failures),
            ("alerts_sent_total", "Alerts delivered to the operator", &self.alerts_sent),
            (
                "alerts_suppressed_total",
                "Alarms against allow-listed senders",
                &self.alerts_suppressed,
            ),
            ("blocks_total", "Addresses blocked", &self.blocks),
            ("whitelisted_total", "Addresses added to the allow-list", &self.whitelisted),
            ("resets_total", "Segment purges after a block", &self.resets),
        ];

        for (name, help, counter) in counters {
            write_header(&mut output, name, help, "counter");
            let _ = writeln!(output, "ddos_watch_{} {}\n", name, Self::get(counter));
        }

        write_header(&mut output, "decisions_total", "Decisions by outcome", "counter");
        for (label, counter) in [
            ("insufficient_data", &self.decisions_insufficient),
            ("safe", &self.decisions_safe),
            ("alarm", &self.decisions_alarm),
        ] {
            let _ = writeln!(
                output,
                "ddos_watch_decisions_total{{decision=\"{}\"}} {}",
                label,
                Self::get(counter)
            );
        }
        output.push('\n');

        write_header(
            &mut output,
            "last_ddos_probability",
            "Probability of the latest verdict",
            "gauge",
        );
        let _ = writeln!(
            output,
            "ddos_watch_last_ddos_probability {}",
            self.last_probability()
        );

        output
    }
}

fn write_header(output: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(output, "# HELP ddos_watch_{} {}", name, help);
    let _ = writeln!(output, "# TYPE ddos_watch_{} {}", name, kind);
}

/// Shared metrics handle for use across threads/tasks.
pub type SharedMetrics = Arc<Metrics>;

/// Create a new shared metrics instance.
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(Metrics::new())
}

/// Runs the Prometheus metrics HTTP server until shutdown.
///
/// This is a minimal HTTP server that only answers GET requests. It is
/// designed to be lightweight and not add an HTTP framework dependency.
pub async fn run_metrics_server(
    config: MetricsConfig,
    metrics: SharedMetrics,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.bind_address).await?;
    info!(
        "Prometheus metrics server listening on http://{}{}",
        listener.local_addr()?,
        METRICS_PATH
    );

    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.triggered() => {
                info!("Metrics server shutting down");
                break;
            }
        };

        debug!("Metrics request from {}", addr);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = serve(socket, &metrics).await {
                debug!("Failed to answer {}: {}", addr, e);
            }
        });
    }

    Ok(())
}

async fn serve(mut socket: TcpStream, metrics: &Metrics) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let response = response_for(&request, metrics);
    socket.write_all(response.as_bytes()).await
}

fn response_for(request: &str, metrics: &Metrics) -> String {
    let path = request
        .strip_prefix("GET ")
        .and_then(|rest| rest.split_whitespace().next());

    let (status, content_type, body) = match path {
        Some(METRICS_PATH) => (
            "200 OK",
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.to_prometheus_format(),
        ),
        Some("/") | Some("/health") => ("200 OK", "text/plain", "OK\n".to_string()),
        _ => ("404 Not Found", "text/plain", String::new()),
    };

    format!(
        "HTTP/1.1 {}\r\n\
        Content-Type: {}\r\n\
        Content-Length: {}\r\n\
        Connection: close\r\n\
        \r\n\
        {}",
        status,
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(Metrics::get(&metrics.segments_captured), 0);
        assert_eq!(metrics.last_probability(), 0.0);
    }

    #[test]
    fn test_record_verdict_and_decisions() {
        let metrics = Metrics::new();

        metrics.record_verdict(0.42);
        metrics.record_decision(Decision::Alarm);
        metrics.record_decision(Decision::Alarm);
        metrics.record_decision(Decision::Safe);

        assert_eq!(Metrics::get(&metrics.verdicts), 1);
        assert_eq!(metrics.last_probability(), 0.42);
        assert_eq!(Metrics::get(&metrics.decisions_alarm), 2);
        assert_eq!(Metrics::get(&metrics.decisions_safe), 1);
        assert_eq!(Metrics::get(&metrics.decisions_insufficient), 0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        for _ in 0..3 {
            Metrics::inc(&metrics.segments_captured);
        }
        metrics.record_decision(Decision::InsufficientData);
        metrics.record_verdict(0.5);

        let output = metrics.to_prometheus_format();

        assert!(output.contains("ddos_watch_segments_captured_total 3"));
        assert!(output.contains("ddos_watch_decisions_total{decision=\"insufficient_data\"} 1"));
        assert!(output.contains("ddos_watch_last_ddos_probability 0.5"));
        assert!(output.contains("# TYPE ddos_watch_resets_total counter"));
    }

    #[test]
    fn test_response_routing() {
        let metrics = Metrics::new();
        assert!(response_for("GET /metrics HTTP/1.1\r\n", &metrics)
            .contains("ddos_watch_cycles_total"));
        assert!(response_for("GET /health HTTP/1.1\r\n", &metrics).starts_with("HTTP/1.1 200"));
        assert!(response_for("GET /other HTTP/1.1\r\n", &metrics).starts_with("HTTP/1.1 404"));
        assert!(response_for("POST /metrics HTTP/1.1\r\n", &metrics).starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_server_answers_and_stops() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bind_address = probe.local_addr().unwrap();
        drop(probe);

        let metrics = new_shared_metrics();
        Metrics::inc(&metrics.cycles);
        let (trigger, shutdown) = shutdown::channel();
        let server = tokio::spawn(run_metrics_server(
            MetricsConfig {
                enabled: true,
                bind_address,
            },
            Arc::clone(&metrics),
            shutdown,
        ));

        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(bind_address).await {
                stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
                stream.read_to_string(&mut body).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(body.contains("ddos_watch_cycles_total 1"));

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
