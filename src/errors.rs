//! Typed error hierarchy for the QA orchestrator.
//!
//! Four enums cover the four subsystems:
//! - `SessionError`: remote login sessions and reachability probing
//! - `StageError`: per-stage execution failures (local or remote)
//! - `BackendError`: state service queries and artifact uploads
//! - `ConfigError`: stage table and configuration validation

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the remote execution session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("Authentication as {user}@{host} was rejected")]
    Authentication { host: String, user: String },

    #[error("Session to {host} dropped while the command was running: {message}")]
    DisconnectDuringCommand { host: String, message: String },

    #[error("{host} did not become reachable within {timeout_secs}s")]
    ReachabilityTimeout { host: String, timeout_secs: u64 },

    #[error("Remote command on {host} was cancelled")]
    Cancelled { host: String },
}

/// Errors from a single stage execution.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Script {path} not found")]
    ScriptNotFound { path: PathBuf },

    #[error("Stage {stage} exited with non-zero code {exit_code}")]
    NonZeroExit { stage: String, exit_code: i32 },

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write log file at {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage {stage} was interrupted")]
    Cancelled { stage: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors from the backend state client.
///
/// None of these abort a run on their own; callers decide how to degrade.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("Backend returned HTTP {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Backend returned an unexpected payload: {0}")]
    UnexpectedPayload(String),

    #[error("Upload of {field} failed: {message}")]
    UploadFailure { field: String, message: String },

    #[error("Failed to read artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while validating stage configuration before a run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown stage '{0}'. Valid stages: setup, led, nvme, hotspot, gpu, final")]
    UnknownStage(String),

    #[error("Device id '{id}' does not match pattern {pattern}")]
    InvalidDeviceId { id: String, pattern: String },

    #[error("Stage {stage}: script {path} does not exist")]
    ScriptMissing { stage: String, path: PathBuf },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
