//! Error types shared by every pipeline stage
//!
//! Errors that make a whole subject unusable (missing inputs, too little data to
//! estimate noise, malformed gradient tables) propagate out of the pipeline.
//! Per-voxel and per-volume failures are absorbed by the stages themselves and
//! only surface as sentinels, warnings and counters.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IvimError>;

#[derive(Debug, Error)]
pub enum IvimError {
    /// Noise estimation cannot proceed for a volume.
    #[error(
        "insufficient data for noise estimation in volume {volume}: \
         {found} usable voxels, need at least {required}"
    )]
    InsufficientData {
        volume: usize,
        found: usize,
        required: usize,
    },

    /// A single voxel's fit did not converge.
    #[error("fit did not converge: {reason}")]
    FitConvergence { reason: &'static str },

    /// Array shapes of two inputs disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Malformed or inconsistent b-value/b-vector table.
    #[error("gradient table: {0}")]
    Gradient(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// NIfTI decoding or encoding failure.
    #[error("NIfTI: {0}")]
    Nifti(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl IvimError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IvimError::Io { path: path.into(), source }
    }
}
