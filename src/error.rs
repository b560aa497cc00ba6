//! Domain-specific error types for DDoS Watch.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the segment directory.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Capture directory '{path}' is unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list capture directory '{path}': {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete '{path}': {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while building the cumulative snapshot.
///
/// All of these are recoverable: the supervisor logs them and moves on to
/// the next capture unit.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("No capture segments available to merge")]
    NoSegments,

    #[error("Merge cancelled by shutdown")]
    Cancelled,

    #[error("Failed to launch merge tool '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Merge tool '{tool}' exited with status {status}")]
    ToolFailed { tool: String, status: String },

    #[error("Merge tool reported success but '{path}' does not exist")]
    MissingOutput { path: PathBuf },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors that can occur while acquiring a capture segment.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to launch capture tool '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture tool '{tool}' exited with status {status}")]
    ToolFailed { tool: String, status: String },

    #[error("Capture tool finished but segment '{path}' was not written")]
    MissingSegment { path: PathBuf },

    #[error("Failed to query capture devices: {0}")]
    Device(#[from] pcap::Error),

    #[error("No suitable capture device found")]
    NoDeviceFound,
}

/// Conditions that abort the process before the capture loop starts.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("{role} tool '{tool}' was not found (set its path in the configuration)")]
    ToolMissing { role: &'static str, tool: String },

    #[error("Classifier model '{path}' does not exist")]
    ModelMissing { path: PathBuf },

    #[error("Insufficient privilege: live capture and firewall changes require root")]
    InsufficientPrivilege,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Errors raised by the remediation backends.
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("Failed to run firewall command '{command}': {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Allow-list file '{path}' could not be updated: {source}")]
    Whitelist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while reading a classifier result file.
#[derive(Error, Debug, PartialEq)]
pub enum VerdictParseError {
    #[error("Result file has no header line")]
    MissingHeader,

    #[error("Result file has no data row")]
    MissingRow,

    #[error("Result file is missing column '{0}'")]
    MissingColumn(&'static str),

    #[error("Column '{column}' has invalid value '{value}'")]
    InvalidNumber { column: &'static str, value: String },
}
