//! Report Module
//!
//! Renders offline results (sender rankings, one-shot classifications) as
//! text for terminals or JSON for other tools.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::decision::{Decision, Thresholds};
use crate::inference::VerdictRow;
use crate::senders::{SenderCount, SenderFrequency};

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// Renders the `limit` busiest senders of a capture.
pub fn export_senders(
    file: &Path,
    frequency: &SenderFrequency,
    limit: usize,
    format: OutputFormat,
) -> String {
    let top = frequency.top(limit);
    match format {
        OutputFormat::Json => to_json_pretty(&top),
        OutputFormat::JsonLines => top
            .iter()
            .filter_map(|entry| serde_json::to_string(entry).ok())
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Text => senders_text(file, frequency, &top),
    }
}

fn senders_text(file: &Path, frequency: &SenderFrequency, top: &[SenderCount]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Senders in {}\n", file.display());

    if top.is_empty() {
        output.push_str("No non-local IP traffic found\n");
        return output;
    }

    let _ = writeln!(output, "{:<40} {:>10} {:>8}", "Address", "Packets", "Share");
    output.push_str(&"-".repeat(60));
    output.push('\n');
    for entry in top {
        let _ = writeln!(
            output,
            "{:<40} {:>10} {:>7.1}%",
            entry.address,
            entry.count,
            share(entry.count, frequency.total())
        );
    }
    let _ = writeln!(output, "\nTotal packets counted: {}", frequency.total());
    output
}

fn share(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

/// A one-shot classification and what the pipeline would have decided.
#[derive(Debug, Serialize)]
pub struct ClassificationReport<'a> {
    pub verdict: &'a VerdictRow,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspect: Option<SenderCount>,
}

impl<'a> ClassificationReport<'a> {
    pub fn new(
        verdict: &'a VerdictRow,
        thresholds: &Thresholds,
        suspect: Option<SenderCount>,
    ) -> Self {
        Self {
            verdict,
            decision: Decision::for_verdict(verdict, thresholds),
            suspect,
        }
    }
}

pub fn export_classification(report: &ClassificationReport<'_>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => to_json_pretty(report),
        OutputFormat::JsonLines => serde_json::to_string(report)
            .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)),
        OutputFormat::Text => {
            let verdict = report.verdict;
            let mut output = String::new();
            let _ = writeln!(output, "Model:        {}", verdict.model);
            let _ = writeln!(output, "Packets:      {}", verdict.packet_count);
            let _ = writeln!(output, "Samples:      {}", verdict.sample_count);
            let _ = writeln!(output, "Probability:  {}", verdict.probability_pretty());
            let _ = writeln!(output, "Decision:     {}", report.decision);
            if let Some(suspect) = report.suspect {
                let _ = writeln!(
                    output,
                    "Top sender:   {} ({} packets)",
                    suspect.address, suspect.count
                );
            }
            output
        }
    }
}

fn to_json_pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::IpAddr;

    fn frequency() -> SenderFrequency {
        let senders: Vec<IpAddr> = ["203.0.113.5", "198.51.100.7", "203.0.113.5", "203.0.113.5"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        SenderFrequency::from_senders(senders, &HashSet::new())
    }

    fn verdict(packets: u64, probability: f64) -> VerdictRow {
        VerdictRow {
            model: "DOS2019-LUCID".to_string(),
            elapsed_time: Some(0.2),
            packet_count: packets,
            sample_count: 10,
            ddos_probability: probability,
            accuracy: None,
            f1: None,
            tpr: None,
            fpr: None,
            tnr: None,
            fnr: None,
            source: "merged.pcap".to_string(),
        }
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "jsonl".parse::<OutputFormat>().unwrap(),
            OutputFormat::JsonLines
        );
        assert!("csv".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::JsonLines.to_string(), "jsonl");
    }

    #[test]
    fn test_senders_json_uses_collector_field_names() {
        let json = export_senders(Path::new("x.pcap"), &frequency(), 10, OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed[0]["IpAddress"], "203.0.113.5");
        assert_eq!(parsed[0]["RequestCount"], 3);
        assert_eq!(parsed[1]["IpAddress"], "198.51.100.7");
    }

    #[test]
    fn test_senders_limit_and_text() {
        let text = export_senders(Path::new("x.pcap"), &frequency(), 1, OutputFormat::Text);
        assert!(text.contains("203.0.113.5"));
        assert!(!text.contains("198.51.100.7"));
        assert!(text.contains("75.0%"));

        let empty = export_senders(
            Path::new("x.pcap"),
            &SenderFrequency::new(),
            10,
            OutputFormat::Text,
        );
        assert!(empty.contains("No non-local IP traffic"));
    }

    #[test]
    fn test_classification_report() {
        let thresholds = Thresholds {
            min_packets_count: 50,
            ip_block_threshold: 0.8,
        };
        let row = verdict(120, 0.95);
        let report = ClassificationReport::new(&row, &thresholds, frequency().most_frequent());

        assert_eq!(report.decision, Decision::Alarm);
        let text = export_classification(&report, OutputFormat::Text);
        assert!(text.contains("95.0%"));
        assert!(text.contains("Top sender:   203.0.113.5 (3 packets)"));

        let json: serde_json::Value =
            serde_json::from_str(&export_classification(&report, OutputFormat::Json)).unwrap();
        assert_eq!(json["decision"], "alarm");
        assert_eq!(json["verdict"]["packet_count"], 120);
    }
}
