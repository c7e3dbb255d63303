//! Error taxonomy for the segmentation pipeline

use thiserror::Error;

/// Errors raised by the pipeline stages.
///
/// Every variant is fatal for the run: stages validate their own
/// preconditions and never fall back to defaults.
#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("insufficient features: need at least {required} feature columns, got {found}")]
    InsufficientFeatures { required: usize, found: usize },

    #[error("insufficient classes: need at least 2 distinct cluster labels, got {found}")]
    InsufficientClasses { found: usize },

    #[error("k selection did not converge on distortion curve {distortions:?}")]
    NoConvergence { distortions: Vec<f64> },

    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error("classifier training failed: {0}")]
    Training(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("report formatting failed: {0}")]
    Format(#[from] std::fmt::Error),
}
