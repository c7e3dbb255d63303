//! Command-line interface definitions and argument parsing

use crate::config::PipelineConfig;
use clap::Parser;
use std::path::PathBuf;

/// Customer segmentation CLI: RFM profiling, K-Means and cluster interpretation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transactions file (.csv or .parquet)
    #[arg(short, long, default_value = "transactions.csv")]
    pub input: PathBuf,

    /// Output directory for data, models and the control file
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,

    /// Optional TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Always retrain the interpreter, ignoring a persisted one
    #[arg(long)]
    pub retrain: bool,

    /// Random seed for clustering and interpretation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of hyperparameter candidates to evaluate
    #[arg(long)]
    pub search_iter: Option<usize>,

    /// Number of cross-validation folds
    #[arg(long)]
    pub cv_folds: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Load the configuration file (or defaults) and apply flag overrides
    pub fn pipeline_config(&self) -> crate::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_toml_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(seed) = self.seed {
            config.segmenter.seed = seed;
            config.interpreter.seed = seed;
        }
        if let Some(n_iter) = self.search_iter {
            config.interpreter.search_iterations = n_iter;
        }
        if let Some(folds) = self.cv_folds {
            config.interpreter.cv_folds = folds;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["segmentforge"]).unwrap();
        assert_eq!(args.input, PathBuf::from("transactions.csv"));
        assert!(!args.retrain);

        let config = args.pipeline_config().unwrap();
        assert_eq!(config.interpreter.cv_folds, 10);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[interpreter]\ncv_folds = 4\nsearch_iterations = 3").unwrap();
        let path = file.path().to_str().unwrap();

        let args = Args::try_parse_from([
            "segmentforge",
            "--config",
            path,
            "--seed",
            "42",
            "--cv-folds",
            "5",
        ])
        .unwrap();
        let config = args.pipeline_config().unwrap();

        assert_eq!(config.segmenter.seed, 42);
        assert_eq!(config.interpreter.seed, 42);
        assert_eq!(config.interpreter.cv_folds, 5);
        assert_eq!(config.interpreter.search_iterations, 3);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::try_parse_from(["segmentforge", "--cv-folds", "1"]).unwrap();
        assert!(args.pipeline_config().is_err());
    }
}
