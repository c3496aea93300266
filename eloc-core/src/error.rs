use thiserror::Error;

use crate::session::RecState;

/// All errors produced by eloc-core.
#[derive(Debug, Error)]
pub enum ElocError {
    #[error("peripheral rejected configuration: {0}")]
    HardwareConfig(String),

    #[error("peripheral read failed: {0}")]
    PeripheralRead(String),

    #[error("sample buffer allocation failed ({requested} samples)")]
    OutOfMemory { requested: usize },

    #[error("storage not available: {0}")]
    StorageUnavailable(String),

    #[error("could not open recording file at {path}: {reason}")]
    OpenFailed { path: std::path::PathBuf, reason: String },

    #[error("invalid mode transition from {from} to {requested}")]
    InvalidTransition { from: RecState, requested: RecState },

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("unknown mode token: {0}")]
    UnknownModeToken(String),

    #[error("WAV container error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ElocError>;
