//! Error handling

use std::path::PathBuf;

use thiserror::Error;

use super::types::SwitchId;

/// Errors from the switch control plane
#[derive(Debug, Clone, Error)]
pub enum SwitchError {
    #[error("switch {0} is not connected")]
    Unreachable(SwitchId),

    #[error("switch {switch} rejected the request: {reason}")]
    Rejected { switch: SwitchId, reason: String },
}

/// Errors reading or writing the peak-traffic snapshot
#[derive(Debug, Error)]
pub enum PeakFileError {
    #[error("peak file {0:?} not found")]
    NotFound(PathBuf),

    #[error("peak file {0:?} is empty")]
    Empty(PathBuf),

    #[error("malformed peak file line {line}: {content:?}")]
    Malformed { line: usize, content: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine-level errors surfaced to the admin layer
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("network already initialized")]
    AlreadyInitialized,

    #[error("network not initialized")]
    NotInitialized,

    #[error("binding directory has no access ports")]
    NoBindings,

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error(transparent)]
    PeakFile(#[from] PeakFileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bindings file: {0}")]
    Json(#[from] serde_json::Error),
}
