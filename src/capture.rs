//! Packet capture - the producer side of the pipeline.
//!
//! Each call to [`SegmentCapture::capture_segment`] runs the external capture
//! tool once and yields exactly one segment file:
//!
//! ```text
//! <capture-tool> -i <iface>... -c <packets> -F pcap -w <segment>
//! ```
//!
//! The tool runs in its own process group. On shutdown it is given a short
//! grace period to finish the unit it is writing, then its whole tree is
//! killed.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use pcap::Device;
use tracing::{debug, info, trace};

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::shutdown::Shutdown;
use crate::subprocess::ManagedChild;

/// How a capture attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The segment was written completely.
    Written,
    /// Shutdown arrived before the unit was complete.
    Interrupted,
}

/// Runs the capture tool, one segment per invocation.
#[derive(Debug, Clone)]
pub struct SegmentCapture {
    tool: String,
    interfaces: Vec<String>,
    packets_per_segment: u32,
    shutdown_grace: Duration,
}

impl SegmentCapture {
    pub fn new(config: &CaptureConfig, interfaces: Vec<String>) -> Self {
        Self {
            tool: config.capture_tool.clone(),
            interfaces,
            packets_per_segment: config.packets_per_segment,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Arguments passed to the capture tool for `output`.
    pub fn command_args(&self, output: &Path) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.interfaces.len() * 2 + 6);
        for iface in &self.interfaces {
            args.push(OsString::from("-i"));
            args.push(OsString::from(iface));
        }
        args.push(OsString::from("-c"));
        args.push(OsString::from(self.packets_per_segment.to_string()));
        args.push(OsString::from("-F"));
        args.push(OsString::from("pcap"));
        args.push(OsString::from("-w"));
        args.push(output.as_os_str().to_os_string());
        args
    }

    /// Captures one unit into `output`.
    pub async fn capture_segment(
        &self,
        output: &Path,
        shutdown: &Shutdown,
    ) -> Result<CaptureOutcome, CaptureError> {
        let mut child = ManagedChild::spawn("capture", &self.tool, self.command_args(output))
            .map_err(|source| CaptureError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = shutdown.triggered() => None,
        };

        let status = match finished {
            Some(status) => status,
            None => {
                trace!(
                    "Shutdown requested, giving the capture tool {:?} to finish",
                    self.shutdown_grace
                );
                match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        if let Err(e) = child.terminate().await {
                            debug!("Failed to terminate capture tool: {}", e);
                        }
                        info!("Capture interrupted before {} was complete", output.display());
                        return Ok(CaptureOutcome::Interrupted);
                    }
                }
            }
        };

        let status = status.map_err(|source| CaptureError::Spawn {
            tool: self.tool.clone(),
            source,
        })?;
        if !status.success() {
            return Err(CaptureError::ToolFailed {
                tool: self.tool.clone(),
                status: status.to_string(),
            });
        }
        if !output.exists() {
            return Err(CaptureError::MissingSegment {
                path: output.to_path_buf(),
            });
        }

        trace!("Captured {}", output.display());
        Ok(CaptureOutcome::Written)
    }
}

/// Lists all available network devices.
pub fn list_devices() -> Result<Vec<Device>, CaptureError> {
    Ok(Device::list()?)
}

/// Name of pcap's default capture device.
pub fn default_interface() -> Result<String, CaptureError> {
    Device::lookup()?
        .map(|device| device.name)
        .ok_or(CaptureError::NoDeviceFound)
}

/// Interfaces to capture on: the configured ones, or pcap's default device.
pub fn resolve_interfaces(configured: &[String]) -> Result<Vec<String>, CaptureError> {
    if !configured.is_empty() {
        return Ok(configured.to_vec());
    }
    let iface = default_interface()?;
    info!("No interface configured, using default device {}", iface);
    Ok(vec![iface])
}
