#![forbid(unsafe_code)]
//! Error types for the cask block storage engine.
//!
//! Defines [`CaskError`] and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;

/// Unified error type for all cask operations.
#[derive(Debug, Error)]
pub enum CaskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already present: {0}")]
    AlreadyPresent(String),

    #[error("container {0} is full")]
    ContainerFull(String),

    #[error("container {container} is read-only: {reason}")]
    ContainerReadOnly { container: String, reason: String },

    #[error("corruption in container {container}: {detail}")]
    Corruption { container: String, detail: String },

    #[error("disk failure: {0}")]
    DiskFailure(#[from] std::io::Error),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl CaskError {
    /// Whether this error indicates an underlying I/O failure that should be
    /// reported to the disk-failure handler.
    #[must_use]
    pub fn is_disk_failure(&self) -> bool {
        matches!(self, Self::DiskFailure(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `CaskError`.
pub type Result<T> = std::result::Result<T, CaskError>;
