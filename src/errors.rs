//! Typed error hierarchy for the baton build driver.
//!
//! Top-level enums cover the subsystems:
//! - `InvocationError`: fatal invocation failures (configuration, resumption)
//! - `ExecError`: subprocess spawn/wait/signal failures
//! - `ArchiveError`: checkpoint and artifact archive failures
//! - `StoreError`: remote store backend failures
//! - `TransportError`: failures surviving the retry layer

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an invocation before any checkpoint is attempted.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Build version file {path} is unreadable: {source}")]
    VersionUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Build version file {path} is empty")]
    VersionEmpty { path: PathBuf },

    #[error("Cannot resume from checkpoint '{name}': {message}")]
    Resumption { name: String, message: String },
}

impl InvocationError {
    /// Whether this is a configuration-class failure (as opposed to resumption).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            InvocationError::Configuration(_)
                | InvocationError::VersionUnreadable { .. }
                | InvocationError::VersionEmpty { .. }
        )
    }
}

/// Errors from the subprocess layer.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for '{program}': {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process group {pgid}: {source}")]
    SignalFailed {
        pgid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

/// Errors from archive creation and extraction.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("None of the archive entries exist under {root}")]
    NothingToArchive { root: PathBuf },

    #[error("Archive task panicked or was cancelled: {0}")]
    Join(String),
}

/// Errors reported by a remote store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact '{0}' not found")]
    NotFound(String),

    #[error("Artifact '{0}' already exists")]
    Conflict(String),

    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Store returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed store manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Errors that survive the transport retry layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Artifact '{name}' does not exist in the remote store")]
    NotFound { name: String },

    #[error("{operation} of '{name}' failed after {attempts} attempt(s): {last}")]
    Exhausted {
        operation: &'static str,
        name: String,
        attempts: u32,
        #[source]
        last: StoreError,
    },
}
