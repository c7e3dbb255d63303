//! SegmentForge: customer segmentation on RFM profiles
//!
//! Transactions are turned into per-customer RFM and behavioral features,
//! robust-scaled and clustered with K-Means (k chosen at the elbow of the
//! distortion curve). A gradient boosted classifier then learns the cluster
//! labels so that permutation importance can explain each cluster.

pub mod booster;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod interpret;
pub mod io;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod scaler;
pub mod search;

// Re-export public items for easier access
pub use booster::{BoosterParams, GradientBoostingClassifier};
pub use cli::Args;
pub use config::{InterpreterConfig, PipelineConfig, SegmenterConfig};
pub use data::{LabeledProfile, ProfileTable};
pub use error::SegmentationError;
pub use features::FeatureEngineer;
pub use interpret::{ImportanceRecord, ImportanceRow, Interpretation, Interpreter};
pub use io::{Backend, LocalStore, MemoryStore, OutputSink, TransactionSource};
pub use model::{find_best_elbow, ClusterModel, Segmentation, Segmenter};
pub use pipeline::{ControlFile, Pipeline, PipelineOutput};
pub use scaler::RobustScaler;
pub use search::{ParamGrid, RandomizedSearch};

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, SegmentationError>;
