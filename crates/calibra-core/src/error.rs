//! Error types for adapter construction, graph inspection and preprocessing.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("Failed to load model from {path}: {reason}")]
    ModelLoadError { path: PathBuf, reason: String },

    /// `index` is the failing pair, `None` when the whole batch failed.
    #[error("Failed to preprocess {}: {reason}", sample_label(.index))]
    PreprocessError {
        index: Option<usize>,
        reason: String,
    },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    #[error("Chat template error: {0}")]
    TemplateError(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn model_load(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::ModelLoadError {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn preprocess(index: usize, reason: impl ToString) -> Self {
        Self::PreprocessError {
            index: Some(index),
            reason: reason.to_string(),
        }
    }

    /// Failure that prevents every pair of a batch from being processed.
    pub fn preprocess_batch(reason: impl ToString) -> Self {
        Self::PreprocessError {
            index: None,
            reason: reason.to_string(),
        }
    }

    /// Re-labels a failure as a load failure for `path`, keeping an existing
    /// `ModelLoadError` untouched.
    pub fn into_load_error(self, path: impl AsRef<Path>) -> Self {
        match self {
            err @ Self::ModelLoadError { .. } => err,
            other => Self::model_load(path, other),
        }
    }

    /// Re-labels a failure as belonging to calibration sample `index`.
    pub fn into_preprocess_error(self, index: usize) -> Self {
        match self {
            err @ Self::PreprocessError { .. } => err,
            other => Self::preprocess(index, other),
        }
    }

    /// Re-labels a failure as one of the whole preprocessing batch.
    pub fn into_batch_preprocess_error(self) -> Self {
        match self {
            err @ Self::PreprocessError { .. } => err,
            other => Self::preprocess_batch(other),
        }
    }
}

fn sample_label(index: &Option<usize>) -> String {
    match index {
        Some(index) => format!("calibration sample {index}"),
        None => "calibration batch".to_string(),
    }
}
