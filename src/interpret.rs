//! Cluster interpretation: a classifier that reproduces the cluster labels,
//! per-cluster permutation importance and anomaly detection

use crate::booster::{BoosterParams, GradientBoostingClassifier};
use crate::config::InterpreterConfig;
use crate::data::{LabeledProfile, CLUSTER};
use crate::error::SegmentationError;
use crate::metrics::{f1_macro, EvalMetrics};
use crate::search::RandomizedSearch;
use ndarray::{Array2, ArrayView2, Axis};
use polars::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const SCORE_DECIMALS: i32 = 4;

/// Importance of one feature for one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScore {
    pub feature: String,
    pub score: f64,
}

/// Top features of one cluster, highest score first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceRecord {
    pub cluster: usize,
    pub features: Vec<FeatureScore>,
}

impl ImportanceRecord {
    /// All listed scores are exactly zero
    pub fn is_anomalous(&self) -> bool {
        self.features.iter().all(|f| f.score == 0.0)
    }
}

/// One row of the exploded importance table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceRow {
    pub cluster: usize,
    pub important_feature: String,
    pub score: f64,
    /// 1-based position within the cluster
    pub rank_important: usize,
    pub is_anomaly: bool,
}

/// Everything the interpretation stage produces
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub importances: Vec<ImportanceRecord>,
    /// Anomaly flag per cluster
    pub anomalies: BTreeMap<usize, bool>,
    pub importance_table: Vec<ImportanceRow>,
    /// Strictly positive features of the non-anomalous clusters
    pub significant_features: Vec<ImportanceRecord>,
    pub is_anomaly_exist: bool,
    pub classifier: GradientBoostingClassifier,
    pub best_params: BoosterParams,
    pub eval_metrics: EvalMetrics,
    /// False when a supplied classifier was reused
    pub is_train_interpreter: bool,
}

impl Interpretation {
    /// Exploded importance table as a DataFrame
    pub fn importance_frame(&self) -> crate::Result<DataFrame> {
        importance_table_frame(&self.importance_table)
    }

    /// Clusters flagged as anomalous, ascending
    pub fn anomaly_clusters(&self) -> Vec<usize> {
        self.anomalies
            .iter()
            .filter(|(_, &flag)| flag)
            .map(|(&c, _)| c)
            .collect()
    }
}

/// Render importance rows as a DataFrame
pub fn importance_table_frame(rows: &[ImportanceRow]) -> crate::Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(CLUSTER, rows.iter().map(|r| r.cluster as u32).collect::<Vec<u32>>()),
        Series::new(
            "important_feature",
            rows.iter().map(|r| r.important_feature.clone()).collect::<Vec<String>>(),
        ),
        Series::new("score", rows.iter().map(|r| r.score).collect::<Vec<f64>>()),
        Series::new(
            "rank_important",
            rows.iter().map(|r| r.rank_important as u32).collect::<Vec<u32>>(),
        ),
        Series::new("is_anomaly", rows.iter().map(|r| r.is_anomaly).collect::<Vec<bool>>()),
    ])?;
    Ok(df)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Trains the cluster classifier and explains every cluster
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    config: InterpreterConfig,
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Train (or reuse) the classifier, evaluate it and rank features per cluster.
    ///
    /// A supplied classifier is reused only when it was trained on the same
    /// feature columns and the same set of cluster labels.
    pub fn interpret(
        &self,
        labeled: &LabeledProfile,
        prior: Option<GradientBoostingClassifier>,
    ) -> crate::Result<Interpretation> {
        self.config.validate()?;
        let classes = labeled.distinct_clusters();
        if classes.len() < 2 {
            return Err(SegmentationError::InsufficientClasses {
                found: classes.len(),
            });
        }

        let features = labeled.profile.features.view();
        let targets = &labeled.clusters;
        let feature_names = &labeled.profile.feature_names;

        let (train_idx, test_idx) = self.split_data(targets.len());
        let x_train = features.select(Axis(0), &train_idx);
        let y_train: Vec<usize> = train_idx.iter().map(|&i| targets[i]).collect();
        let x_test = features.select(Axis(0), &test_idx);
        let y_test: Vec<usize> = test_idx.iter().map(|&i| targets[i]).collect();

        let reusable = prior.filter(|model| {
            let compatible = model.is_trained()
                && &model.feature_names == feature_names
                && model.classes == classes;
            if !compatible {
                warn!("Supplied interpreter does not match this profile, retraining");
            }
            compatible
        });

        let (classifier, best_params, is_train_interpreter) = match reusable {
            Some(model) => {
                info!("Reusing supplied interpreter");
                let params = model.params.clone();
                (model, params, false)
            }
            None => {
                let result = self.train_interpreter(x_train.view(), &y_train, &classes, feature_names)?;
                (result.best_estimator, result.best_params, true)
            }
        };

        let predicted = classifier.predict(x_test.view())?;
        let eval_metrics = EvalMetrics::from_predictions(&y_test, &predicted, SCORE_DECIMALS);
        info!(
            "Interpreter hold-out F1 {:.4}, accuracy {:.4}",
            eval_metrics.f1_score_macro, eval_metrics.accuracy
        );

        let importances = self.calculate_importance(&classifier, features, targets, feature_names)?;
        let anomalies = identify_anomalies(&importances);
        let is_anomaly_exist = anomalies.values().any(|&flag| flag);
        if is_anomaly_exist {
            let flagged: Vec<usize> = anomalies.iter().filter(|(_, &f)| f).map(|(&c, _)| c).collect();
            warn!("Anomaly cluster found: {:?}", flagged);
        } else {
            info!("Anomaly cluster is not found");
        }

        let importance_table = explode_importances(&importances, &anomalies);
        let significant_features = exclude_unimportant(&importances);

        Ok(Interpretation {
            importances,
            anomalies,
            importance_table,
            significant_features,
            is_anomaly_exist,
            classifier,
            best_params,
            eval_metrics,
            is_train_interpreter,
        })
    }

    /// Seeded shuffle split into (train, test) row indices
    pub fn split_data(&self, n_rows: usize) -> (Vec<usize>, Vec<usize>) {
        let n_test = ((self.config.test_size * n_rows as f64).ceil() as usize)
            .max(1)
            .min(n_rows.saturating_sub(1));

        let mut indices: Vec<usize> = (0..n_rows).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        indices.shuffle(&mut rng);

        let mut test = indices[..n_test].to_vec();
        let mut train = indices[n_test..].to_vec();
        test.sort_unstable();
        train.sort_unstable();
        (train, test)
    }

    /// Randomized search over the configured grid
    pub fn train_interpreter(
        &self,
        x_train: ArrayView2<f64>,
        y_train: &[usize],
        classes: &[usize],
        feature_names: &[String],
    ) -> crate::Result<crate::search::SearchResult> {
        RandomizedSearch::new(
            self.config.grid.clone(),
            self.config.search_iterations,
            self.config.cv_folds,
            self.config.seed,
        )
        .fit(x_train, y_train, classes, feature_names)
    }

    /// Top features per cluster, by permutation importance on that cluster's rows
    pub fn calculate_importance(
        &self,
        model: &GradientBoostingClassifier,
        features: ArrayView2<f64>,
        targets: &[usize],
        feature_names: &[String],
    ) -> crate::Result<Vec<ImportanceRecord>> {
        self.config.validate()?;
        let clusters: BTreeSet<usize> = targets.iter().copied().collect();

        clusters
            .into_iter()
            .map(|cluster| -> crate::Result<ImportanceRecord> {
                let rows: Vec<usize> = (0..targets.len()).filter(|&i| targets[i] == cluster).collect();
                let x = features.select(Axis(0), &rows);
                let y = vec![cluster; rows.len()];

                let means = self.permutation_importance(model, &x, &y)?;
                Ok(ImportanceRecord {
                    cluster,
                    features: rank_features(feature_names, &means, self.config.top_features),
                })
            })
            .collect()
    }

    /// Mean drop in macro F1 when each feature column is shuffled.
    ///
    /// Every feature draws from its own ChaCha stream, so the result does
    /// not depend on how features are spread over threads.
    pub fn permutation_importance(
        &self,
        model: &GradientBoostingClassifier,
        features: &Array2<f64>,
        targets: &[usize],
    ) -> crate::Result<Vec<f64>> {
        self.config.validate()?;
        let baseline = f1_macro(targets, &model.predict(features.view())?);
        let repeats = self.config.permutation_repeats;

        (0..features.ncols())
            .into_par_iter()
            .map(|j| -> crate::Result<f64> {
                let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
                rng.set_stream(j as u64);

                let mut permuted = features.clone();
                let mut column: Vec<f64> = features.column(j).to_vec();
                let mut total = 0.0;
                for _ in 0..repeats {
                    column.shuffle(&mut rng);
                    for (slot, &value) in permuted.column_mut(j).iter_mut().zip(&column) {
                        *slot = value;
                    }
                    let score = f1_macro(targets, &model.predict(permuted.view())?);
                    total += baseline - score;
                }
                Ok(total / repeats as f64)
            })
            .collect()
    }
}

/// Sort features by mean importance, keep the top `top_n`, then round.
///
/// The sort is stable, so equal means keep column order.
pub fn rank_features(feature_names: &[String], means: &[f64], top_n: usize) -> Vec<FeatureScore> {
    let mut order: Vec<usize> = (0..means.len().min(feature_names.len())).collect();
    order.sort_by(|&a, &b| means[b].total_cmp(&means[a]));
    order
        .into_iter()
        .take(top_n)
        .map(|j| FeatureScore {
            feature: feature_names[j].clone(),
            score: round_to(means[j], SCORE_DECIMALS),
        })
        .collect()
}

/// A cluster is anomalous when all its top scores are zero
pub fn identify_anomalies(records: &[ImportanceRecord]) -> BTreeMap<usize, bool> {
    records
        .iter()
        .map(|record| (record.cluster, record.is_anomalous()))
        .collect()
}

/// Keep strictly positive features; anomalous clusters are left out
pub fn exclude_unimportant(records: &[ImportanceRecord]) -> Vec<ImportanceRecord> {
    records
        .iter()
        .filter(|record| !record.is_anomalous())
        .map(|record| ImportanceRecord {
            cluster: record.cluster,
            features: record
                .features
                .iter()
                .take_while(|f| f.score > 0.0)
                .cloned()
                .collect(),
        })
        .collect()
}

/// One row per (cluster, feature), tagged with the cluster's anomaly flag
pub fn explode_importances(
    records: &[ImportanceRecord],
    anomalies: &BTreeMap<usize, bool>,
) -> Vec<ImportanceRow> {
    records
        .iter()
        .flat_map(|record| {
            let is_anomaly = anomalies.get(&record.cluster).copied().unwrap_or(false);
            record
                .features
                .iter()
                .enumerate()
                .map(move |(rank, f)| ImportanceRow {
                    cluster: record.cluster,
                    important_feature: f.feature.clone(),
                    score: f.score,
                    rank_important: rank + 1,
                    is_anomaly,
                })
        })
        .collect()
}
