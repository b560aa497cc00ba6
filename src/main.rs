//! DDoS Watch: rolling-capture denial-of-service detector.
//!
//! Traffic is captured in small segments. Every cycle the most recent
//! segments are merged into one snapshot, an external classifier scores the
//! snapshot, and a verdict above the alarm threshold names the busiest remote
//! sender as the suspect and asks an operator what to do about it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌────────────┐   ┌──────────┐
//! │ Capture │──>│ Retention│──>│  Merge  │──>│ Classifier │──>│ Decision │
//! │ (tool)  │   │  (trim)  │   │ (tool)  │   │ (process)  │   │ (engine) │
//! └─────────┘   └──────────┘   └─────────┘   └────────────┘   └────┬─────┘
//!      ^                                                          │ notify
//!      │ reset                ┌──────────────┐  decisions  ┌──────v─────┐
//!      └──────────────────────│ Remediation  │<────────────│  Operator  │
//!                             │  (listener)  │   channel   │ (notifier) │
//!                             └──────────────┘             └────────────┘
//! ```
//!
//! - **Supervisor**: one async task driving the capture/merge/classify loop
//! - **Listener**: async task applying block/allow-list answers
//! - **Metrics**: optional Prometheus endpoint

mod alerting;
mod capture;
mod config;
mod decision;
mod error;
mod event_log;
mod inference;
mod merge;
mod metrics;
mod remediation;
mod report;
mod retention;
mod segment;
mod senders;
mod shutdown;
mod subprocess;
mod supervisor;

#[cfg(test)]
mod testutil;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::alerting::{
    decision_channel, AutoDecisionNotifier, ConsoleNotifier, DecisionSender, LogNotifier,
    Notifier, WebhookNotifier,
};
use crate::capture::{list_devices, resolve_interfaces};
use crate::config::{Config, NotifierKind};
use crate::decision::{AlertDecisionEngine, PipelineState, RemediationListener, Thresholds};
use crate::error::StartupError;
use crate::inference::{InferenceInvoker, InferenceOutcome};
use crate::metrics::{new_shared_metrics, run_metrics_server, Metrics};
use crate::remediation::{FirewallRemediator, Whitelist};
use crate::report::{export_classification, export_senders, ClassificationReport, OutputFormat};
use crate::senders::{local_addresses, SenderFrequency};
use crate::subprocess::{find_executable, is_privileged};
use crate::supervisor::CaptureSupervisor;

/// DDoS Watch: DoS detection over a rolling window of captured traffic.
#[derive(Parser, Debug)]
#[command(name = "ddos-watch")]
#[command(author = "Security Team")]
#[command(version = "0.1.0")]
#[command(about = "Detect DoS attacks by classifying a rolling window of captured traffic")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the capture and detection loop.
    Run {
        /// Configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Interface to capture on; repeat for several (overrides the config).
        #[arg(short, long)]
        interface: Vec<String>,

        /// Enable verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },

    /// List available network interfaces.
    ListInterfaces,

    /// Print the default configuration.
    InitConfig {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rank the senders in a PCAP file (offline mode).
    Senders {
        /// Path to the PCAP file.
        #[arg(short, long)]
        file: PathBuf,

        /// Number of senders to show.
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Output format: text, json, jsonl.
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Count this host's own addresses too.
        #[arg(long)]
        include_local: bool,

        /// Configuration file (for extra local addresses).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run the classifier once against a PCAP file.
    Classify {
        /// Path to the PCAP file.
        #[arg(short, long)]
        file: PathBuf,

        /// Configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format: text, json.
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Enable verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Inspect or edit the allow-list.
    Whitelist {
        /// Configuration file (for the allow-list path).
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: WhitelistAction,
    },
}

#[derive(Subcommand, Debug)]
enum WhitelistAction {
    /// Add an address.
    Add { address: IpAddr },
    /// Remove an address.
    Remove { address: IpAddr },
    /// Print all addresses.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            interface,
            verbose,
        } => {
            let mut config = Config::load_or_default(config.as_deref())?;
            if !interface.is_empty() {
                config.capture.interfaces = interface;
            }
            init_logging(&config.logging.level, verbose)?;
            config.validate().context("Invalid configuration")?;

            run_pipeline(config).await
        }

        Commands::ListInterfaces => {
            let devices = list_devices()?;
            println!("Available network interfaces:\n");
            for device in devices {
                let desc = device
                    .desc
                    .as_ref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default();
                println!("  {}{}", device.name, desc);

                for addr in &device.addresses {
                    println!("    - {}", addr.addr);
                }
            }
            Ok(())
        }

        Commands::InitConfig { output } => {
            let content = Config::generate_default();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Default configuration written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }

        Commands::Senders {
            file,
            count,
            output,
            include_local,
            config,
        } => {
            init_logging("warn", false)?;
            let config = Config::load_or_default(config.as_deref())?;
            let format: OutputFormat = output.parse().map_err(anyhow::Error::msg)?;
            let local = if include_local {
                HashSet::new()
            } else {
                local_addresses(&config.detection.local_addresses)
            };

            let frequency = SenderFrequency::from_pcap(&file, &local)?;
            println!("{}", export_senders(&file, &frequency, count, format));
            Ok(())
        }

        Commands::Classify {
            file,
            config,
            output,
            verbose,
        } => {
            init_logging("warn", verbose)?;
            let config = Config::load_or_default(config.as_deref())?;
            config.validate().context("Invalid configuration")?;
            let format: OutputFormat = output.parse().map_err(anyhow::Error::msg)?;

            run_classify_once(&config, &file, format).await
        }

        Commands::Whitelist { config, action } => {
            let config = Config::load_or_default(config.as_deref())?;
            let whitelist = Whitelist::new(&config.remediation.whitelist_path);

            match action {
                WhitelistAction::Add { address } => {
                    if whitelist.add(address)? {
                        println!("Added {} to {}", address, whitelist.path().display());
                    } else {
                        println!("{} is already allow-listed", address);
                    }
                }
                WhitelistAction::Remove { address } => {
                    if whitelist.remove(address)? {
                        println!("Removed {} from {}", address, whitelist.path().display());
                    } else {
                        println!("{} is not allow-listed", address);
                    }
                }
                WhitelistAction::List => {
                    for address in whitelist.entries()? {
                        println!("{}", address);
                    }
                }
            }
            Ok(())
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("Invalid log level '{}'", default_level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Checks everything the loop needs before it starts.
fn preflight(config: &Config) -> Result<(), StartupError> {
    if config.capture.require_root && !is_privileged() {
        return Err(StartupError::InsufficientPrivilege);
    }

    for (role, tool) in [
        ("Capture", &config.capture.capture_tool),
        ("Merge", &config.merge.merge_tool),
        ("Classifier", &config.inference.classifier),
    ] {
        match find_executable(tool) {
            Some(path) => debug!("{} tool: {}", role, path.display()),
            None => {
                return Err(StartupError::ToolMissing {
                    role,
                    tool: tool.clone(),
                })
            }
        }
    }

    if !config.inference.model_path.exists() {
        return Err(StartupError::ModelMissing {
            path: config.inference.model_path.clone(),
        });
    }
    Ok(())
}

/// Builds the notifier chosen in the configuration.
fn build_notifier(config: &Config, decisions: DecisionSender) -> Result<Arc<dyn Notifier>> {
    let auto_decision = config.remediation.auto_decision;

    let notifier: Arc<dyn Notifier> = match config.notification.kind {
        NotifierKind::Console => {
            let console = ConsoleNotifier::new();
            if auto_decision.is_none() {
                console.listen(decisions.clone());
                info!("Answer alerts on stdin with 'block [#N]' or 'whitelist [#N]'");
            }
            Arc::new(console)
        }
        NotifierKind::Webhook => {
            let webhook = config
                .notification
                .webhook
                .clone()
                .context("notification kind 'webhook' requires a webhook section")?;
            if auto_decision.is_none() {
                warn!(
                    "Webhook alerts cannot be answered; \
                     set remediation.auto_decision to act on them"
                );
            }
            Arc::new(WebhookNotifier::new(webhook))
        }
        NotifierKind::None => Arc::new(LogNotifier::default()),
    };

    Ok(match auto_decision {
        Some(choice) => {
            info!("Alerts will be answered automatically with '{}'", choice);
            Arc::new(AutoDecisionNotifier::new(notifier, choice, decisions))
        }
        None => notifier,
    })
}

/// Runs the detection pipeline until Ctrl+C.
async fn run_pipeline(config: Config) -> Result<()> {
    preflight(&config)?;
    let interfaces =
        resolve_interfaces(&config.capture.interfaces).map_err(StartupError::from)?;

    let local = local_addresses(&config.detection.local_addresses);
    debug!("{} local addresses excluded from attribution", local.len());

    let metrics = new_shared_metrics();
    let pipeline = PipelineState::new();
    let (trigger, shutdown) = shutdown::channel();
    let (decisions_tx, decisions_rx) = decision_channel();

    let remediator = Arc::new(FirewallRemediator::new(
        config.remediation.firewall,
        &config.remediation.whitelist_path,
    ));
    info!(
        "Firewall backend: {}, allow-list: {}",
        config.remediation.firewall,
        config.remediation.whitelist_path.display()
    );

    let notifier = build_notifier(&config, decisions_tx)?;
    let engine = AlertDecisionEngine::new(
        Thresholds::from(&config.detection),
        local,
        notifier,
        event_log::from_config(&config.event_log),
        remediator.clone(),
        Arc::clone(&metrics),
    );

    let listener = RemediationListener::new(remediator, pipeline.clone(), Arc::clone(&metrics));
    let listener_task = tokio::spawn(listener.run(decisions_rx, shutdown.clone()));

    if config.metrics.enabled {
        let (metrics_config, metrics, shutdown) =
            (config.metrics.clone(), Arc::clone(&metrics), shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics_config, metrics, shutdown).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let mut supervisor =
        CaptureSupervisor::new(&config, interfaces, engine, pipeline, Arc::clone(&metrics));
    supervisor.startup_cleanup()?;

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                println!("\nReceived Ctrl+C, shutting down...");
                trigger.trigger();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    supervisor.run(shutdown).await;

    if let Err(e) = listener_task.await {
        warn!("Remediation listener ended abnormally: {}", e);
    }

    info!(
        "Stopped after {} cycles: {} alerts sent, {} blocks, {} resets",
        Metrics::get(&metrics.cycles),
        Metrics::get(&metrics.alerts_sent),
        Metrics::get(&metrics.blocks),
        Metrics::get(&metrics.resets)
    );
    Ok(())
}

/// Classifies one capture file and prints what the loop would decide.
async fn run_classify_once(config: &Config, file: &Path, format: OutputFormat) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("PCAP file not found: {}", file.display());
    }
    if find_executable(&config.inference.classifier).is_none() {
        return Err(StartupError::ToolMissing {
            role: "Classifier",
            tool: config.inference.classifier.clone(),
        }
        .into());
    }

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            trigger.trigger();
        }
    });

    println!("Classifying {}", file.display());
    let invoker = InferenceInvoker::new(&config.inference);
    let verdict = match invoker.run(file, &shutdown).await {
        InferenceOutcome::Verdict(verdict) => verdict,
        InferenceOutcome::TimedOut => anyhow::bail!("Classifier timed out"),
        InferenceOutcome::NoOutput => anyhow::bail!("Classifier exited without a verdict"),
        InferenceOutcome::Cancelled => anyhow::bail!("Interrupted"),
        InferenceOutcome::Failed(reason) => anyhow::bail!("Classification failed: {}", reason),
    };

    let local = local_addresses(&config.detection.local_addresses);
    let suspect = match SenderFrequency::from_pcap(file, &local) {
        Ok(frequency) => frequency.most_frequent(),
        Err(e) => {
            warn!("Could not count senders: {:#}", e);
            None
        }
    };

    let thresholds = Thresholds::from(&config.detection);
    let report = ClassificationReport::new(&verdict, &thresholds, suspect);
    println!("{}", export_classification(&report, format));
    Ok(())
}
