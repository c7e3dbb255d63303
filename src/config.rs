//! Pipeline configuration
//!
//! Defaults reproduce the reference behaviour: seed 0 everywhere, a 20%
//! hold-out, ten search candidates scored by 10-fold cross-validation and
//! five permutation repeats per feature.

use crate::error::SegmentationError;
use crate::search::ParamGrid;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// KMeans / k-selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Seed for KMeans initialization
    pub seed: u64,
    /// Maximum Lloyd iterations per run
    pub max_iterations: u64,
    /// Convergence tolerance
    pub tolerance: f64,
    /// Number of independent initializations per fit
    pub n_runs: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_iterations: 300,
            tolerance: 1e-4,
            n_runs: 10,
        }
    }
}

/// Classifier search and interpretation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Seed shared by the split, the search and permutation importance
    pub seed: u64,
    /// Share of customers held out for evaluation
    pub test_size: f64,
    /// Candidates drawn by the randomized search
    pub search_iterations: usize,
    /// Cross-validation folds per candidate
    pub cv_folds: usize,
    /// Shuffles per feature for permutation importance
    pub permutation_repeats: usize,
    /// Features kept per cluster
    pub top_features: usize,
    /// Hyperparameter grid sampled by the search
    pub grid: ParamGrid,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            test_size: 0.2,
            search_iterations: 10,
            cv_folds: 10,
            permutation_repeats: 5,
            top_features: 5,
            grid: ParamGrid::default(),
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmenter: SegmenterConfig,
    pub interpreter: InterpreterConfig,
}

impl PipelineConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SegmentationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings no stage can run with
    pub fn validate(&self) -> crate::Result<()> {
        self.interpreter.validate()?;
        self.segmenter.validate()
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.n_runs == 0 {
            return Err(SegmentationError::Config(
                "n_runs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl InterpreterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(SegmentationError::Config(format!(
                "test_size must be in (0, 1), got {}",
                self.test_size
            )));
        }
        if self.search_iterations == 0 {
            return Err(SegmentationError::Config(
                "search_iterations must be positive".to_string(),
            ));
        }
        if self.cv_folds < 2 {
            return Err(SegmentationError::Config(format!(
                "cv_folds must be at least 2, got {}",
                self.cv_folds
            )));
        }
        if self.permutation_repeats == 0 || self.top_features == 0 {
            return Err(SegmentationError::Config(
                "permutation_repeats and top_features must be positive".to_string(),
            ));
        }
        self.grid.validate()
    }
}
