// ============================================================================
// ERRORS
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DcrnnError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("checkpoint not found: {0}")]
    MissingCheckpoint(String),
}

impl DcrnnError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DcrnnError::Io { path: path.into(), source }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        DcrnnError::Json { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, DcrnnError>;
