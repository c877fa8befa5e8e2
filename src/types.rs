//! Core types and error definitions shared by every limitbox backend
use std::process::ExitStatus;
use thiserror::Error;

/// One byte
pub const BYTE: u64 = 1;
/// 1024 bytes
pub const KILOBYTE: u64 = 1024 * BYTE;
/// 1024 kilobytes
pub const MEGABYTE: u64 = 1024 * KILOBYTE;
/// 1024 megabytes
pub const GIGABYTE: u64 = 1024 * MEGABYTE;

/// Errors produced while configuring resource groups and running limited commands
#[derive(Error, Debug)]
pub enum LimitError {
    /// Limits or names rejected when a group is created
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("failed to create resource group {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open resource group {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to attach process {pid} to resource group {name}: {source}")]
    Attach {
        name: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The process started but could not be limited; it has been killed
    #[error("failed to limit process {pid} after start")]
    Limit {
        pid: u32,
        #[source]
        source: Box<LimitError>,
    },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("failed to launch process: {0}")]
    Launch(#[source] std::io::Error),

    /// Child ran to completion but did not succeed
    #[error("process exited unsuccessfully: {status}")]
    Exit {
        status: ExitStatus,
        /// Collected standard output, or both streams for combined capture
        output: Vec<u8>,
        /// Captured (and possibly truncated) standard error
        stderr: Vec<u8>,
    },

    #[error("failed to close resource group {name}: {source}")]
    Close {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimitError {
    /// Exit code of the child for `Exit` errors, when it has one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            LimitError::Exit { status, .. } => status.code(),
            _ => None,
        }
    }

    /// Output collected before the child failed
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            LimitError::Exit { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Captured diagnostic output attached to an `Exit` error
    pub fn stderr(&self) -> Option<&[u8]> {
        match self {
            LimitError::Exit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Result type alias for limitbox operations
pub type Result<T> = std::result::Result<T, LimitError>;
