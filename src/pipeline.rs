//! End-to-end run: profile, segment, interpret

use crate::booster::{BoosterParams, GradientBoostingClassifier};
use crate::config::PipelineConfig;
use crate::data::LabeledProfile;
use crate::features::FeatureEngineer;
use crate::interpret::{ImportanceRecord, ImportanceRow, Interpreter};
use crate::metrics::EvalMetrics;
use crate::model::{ClusterModel, Segmenter};
use crate::scaler::RobustScaler;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

/// Run metadata stored next to the models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFile {
    pub trained_params: BoosterParams,
    pub eval_metrics: EvalMetrics,
    pub is_train_interpreter: bool,
    pub is_anomaly_exist: bool,
}

/// Everything a run hands to the output sink
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub labeled: LabeledProfile,
    pub k_selected: usize,
    pub distortions: Vec<f64>,
    pub importances: Vec<ImportanceRecord>,
    pub importance_table: Vec<ImportanceRow>,
    pub significant_features: Vec<ImportanceRecord>,
    pub anomalies: BTreeMap<usize, bool>,
    pub is_anomaly_exist: bool,
    pub scaler: RobustScaler,
    pub cluster_model: ClusterModel,
    pub classifier: GradientBoostingClassifier,
    pub best_params: BoosterParams,
    pub eval_metrics: EvalMetrics,
    pub is_train_interpreter: bool,
}

impl PipelineOutput {
    pub fn control_file(&self) -> ControlFile {
        ControlFile {
            trained_params: self.best_params.clone(),
            eval_metrics: self.eval_metrics.clone(),
            is_train_interpreter: self.is_train_interpreter,
            is_anomaly_exist: self.is_anomaly_exist,
        }
    }

    /// Customer profile with its `cluster` column
    pub fn profile_frame(&self) -> crate::Result<DataFrame> {
        self.labeled.to_dataframe()
    }

    /// One row per (cluster, top feature)
    pub fn importance_frame(&self) -> crate::Result<DataFrame> {
        crate::interpret::importance_table_frame(&self.importance_table)
    }
}

/// Runs the three stages in order
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(
        &self,
        transactions: &DataFrame,
        interpreter: Option<GradientBoostingClassifier>,
    ) -> crate::Result<PipelineOutput> {
        self.config.validate()?;
        let start = Instant::now();

        let profile = FeatureEngineer::new().build_profile(transactions)?;
        info!(
            "Profiled {} customers with {} features",
            profile.n_customers(),
            profile.n_features()
        );

        let segmentation = Segmenter::new(self.config.segmenter.clone()).segment(profile)?;
        info!("Segmented into {} clusters", segmentation.k_selected);

        let interpretation = Interpreter::new(self.config.interpreter.clone())
            .interpret(&segmentation.labeled, interpreter)?;

        info!("Pipeline finished in {:.2}s", start.elapsed().as_secs_f64());

        Ok(PipelineOutput {
            labeled: segmentation.labeled,
            k_selected: segmentation.k_selected,
            distortions: segmentation.distortions,
            importances: interpretation.importances,
            importance_table: interpretation.importance_table,
            significant_features: interpretation.significant_features,
            anomalies: interpretation.anomalies,
            is_anomaly_exist: interpretation.is_anomaly_exist,
            scaler: segmentation.scaler,
            cluster_model: segmentation.cluster_model,
            classifier: interpretation.classifier,
            best_params: interpretation.best_params,
            eval_metrics: interpretation.eval_metrics,
            is_train_interpreter: interpretation.is_train_interpreter,
        })
    }
}
