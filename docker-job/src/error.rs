//! Error types for docker-job.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors returned by the orchestrator client.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Object does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing object or a stale version (HTTP 409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success response from the daemon.
    #[error("daemon returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Connection or protocol failure.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            404 => OrchestratorError::NotFound(message),
            409 => OrchestratorError::Conflict(message),
            _ => OrchestratorError::Api { status, message },
        }
    }

    pub fn transport(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        OrchestratorError::Transport(e.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }
}

/// Invalid command line or spec input, detected before contacting the daemon.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Only bound volumes are supported, expected source:target[:ro|rw]: '{0}'")]
    InvalidVolume(String),

    #[error("Config spec has no source: '{0}'")]
    ConfigSourceMissing(String),

    #[error("Unknown config field '{field}' in '{spec}'")]
    UnknownConfigField { field: String, spec: String },

    #[error("Invalid config mode '{0}', expected an octal number")]
    InvalidMode(String),

    #[error("Cannot set both --repeat-until and --repeat-while")]
    ConflictingRepeat,

    #[error("Invalid repeat pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid docker host '{0}'")]
    InvalidHost(String),
}

/// Terminal failures of the generic poller.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("task failed during execution")]
    Execution,

    #[error("task rejected: bad parameters")]
    BadParameters,

    #[error("task orphaned: node timed out")]
    NodeTimeout,

    #[error("Unknown state: '{0}'")]
    UnknownState(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("state probe failed: {0}")]
    Probe(#[source] OrchestratorError),
}

/// Malformed multiplexed log frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header truncated: got {0} of 8 bytes")]
    TruncatedHeader(usize),

    #[error("frame payload truncated: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    #[error("unknown stream type {0}")]
    UnknownStream(u8),
}

/// Service lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("name conflicts with an existing object: {0}")]
    NameConflict(String),

    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("Failed to create service: {0}")]
    Create(#[source] OrchestratorError),

    #[error("Failed to start service: {0}")]
    Start(#[source] OrchestratorError),

    #[error("Failed to delete service: {0}")]
    Delete(#[source] OrchestratorError),

    #[error("Service update returned warnings: {}", .0.join("; "))]
    Warnings(Vec<String>),

    #[error("Failed to list tasks: {0}")]
    ListTasks(#[source] OrchestratorError),

    #[error("no tasks for generation {generation} of service {service_id} appeared in time")]
    DiscoveryTimeout { service_id: String, generation: u64 },

    #[error("Failed to fetch logs: {0}")]
    Logs(#[source] OrchestratorError),

    #[error("log stream: {0}")]
    Frame(#[from] FrameError),

    #[error("Failed to write output: {0}")]
    Output(#[source] io::Error),

    #[error(transparent)]
    Poll(#[from] PollError),
}

/// SSH tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to run ssh: {0}")]
    Spawn(#[source] io::Error),

    #[error("ssh exited with {status}: {stderr}")]
    Exited { status: ExitStatus, stderr: String },

    #[error("ssh did not open {0} in time")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
