//! Randomized hyperparameter search with stratified cross-validation

use crate::booster::{BoosterParams, GradientBoostingClassifier};
use crate::error::SegmentationError;
use crate::metrics::f1_macro;
use ndarray::{ArrayView2, Axis};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Discrete values the search draws booster parameters from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamGrid {
    pub n_estimators: Vec<usize>,
    pub learning_rate: Vec<f64>,
    pub max_depth: Vec<usize>,
    pub num_leaves: Vec<usize>,
    pub lambda_l1: Vec<f64>,
    pub lambda_l2: Vec<f64>,
    pub min_data_in_leaf: Vec<usize>,
    pub max_bin: Vec<usize>,
    pub feature_fraction: Vec<f64>,
    pub subsample: Vec<f64>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![100, 200, 300, 500],
            learning_rate: vec![0.1, 0.3, 0.5],
            max_depth: vec![6, 15],
            num_leaves: vec![63, 255],
            lambda_l1: vec![0.5, 1.0],
            lambda_l2: vec![0.0, 0.5],
            min_data_in_leaf: vec![20, 500],
            max_bin: vec![127, 255],
            feature_fraction: vec![1.0],
            subsample: vec![0.5, 1.0],
        }
    }
}

impl ParamGrid {
    fn dimensions(&self) -> [usize; 10] {
        [
            self.n_estimators.len(),
            self.learning_rate.len(),
            self.max_depth.len(),
            self.num_leaves.len(),
            self.lambda_l1.len(),
            self.lambda_l2.len(),
            self.min_data_in_leaf.len(),
            self.max_bin.len(),
            self.feature_fraction.len(),
            self.subsample.len(),
        ]
    }

    /// Number of distinct parameter combinations
    pub fn size(&self) -> usize {
        self.dimensions().iter().product()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.dimensions().contains(&0) {
            return Err(SegmentationError::Config(
                "every hyperparameter in the grid needs at least one value".to_string(),
            ));
        }
        let fractions_ok = self
            .feature_fraction
            .iter()
            .chain(&self.subsample)
            .all(|&f| f > 0.0 && f <= 1.0);
        if !fractions_ok {
            return Err(SegmentationError::Config(
                "feature_fraction and subsample must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode a combination index, last dimension varying fastest
    pub fn candidate(&self, index: usize) -> BoosterParams {
        let dims = self.dimensions();
        let mut picks = [0usize; 10];
        let mut rest = index;
        for (slot, &len) in picks.iter_mut().zip(dims.iter()).rev() {
            *slot = rest % len;
            rest /= len;
        }

        BoosterParams {
            n_estimators: self.n_estimators[picks[0]],
            learning_rate: self.learning_rate[picks[1]],
            max_depth: self.max_depth[picks[2]],
            num_leaves: self.num_leaves[picks[3]],
            lambda_l1: self.lambda_l1[picks[4]],
            lambda_l2: self.lambda_l2[picks[5]],
            min_data_in_leaf: self.min_data_in_leaf[picks[6]],
            max_bin: self.max_bin[picks[7]],
            feature_fraction: self.feature_fraction[picks[8]],
            subsample: self.subsample[picks[9]],
        }
    }

    /// Draw up to `n_iter` distinct combinations
    pub fn sample(&self, n_iter: usize, seed: u64) -> Vec<BoosterParams> {
        let size = self.size();
        if n_iter >= size {
            return (0..size).map(|i| self.candidate(i)).collect();
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        sample(&mut rng, size, n_iter)
            .into_iter()
            .map(|i| self.candidate(i))
            .collect()
    }
}

/// Test indices per fold; every class is spread evenly across folds
pub fn stratified_folds(targets: &[usize], n_folds: usize) -> Vec<Vec<usize>> {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &t) in targets.iter().enumerate() {
        by_class.entry(t).or_default().push(i);
    }

    let n_folds = n_folds.max(1);
    let mut folds = vec![Vec::new(); n_folds];
    let mut counter = 0;
    for members in by_class.values() {
        for &i in members {
            folds[counter % n_folds].push(i);
            counter += 1;
        }
    }

    folds.retain(|f| !f.is_empty());
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

/// Cross-validated score of one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: BoosterParams,
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
}

/// Outcome of the search: the refitted best model and every candidate's score
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub best_params: BoosterParams,
    pub best_score: f64,
    pub best_estimator: GradientBoostingClassifier,
    pub candidates: Vec<CandidateScore>,
}

/// Randomized search scored by macro F1
#[derive(Debug, Clone)]
pub struct RandomizedSearch {
    pub grid: ParamGrid,
    pub n_iter: usize,
    pub cv: usize,
    pub seed: u64,
}

impl RandomizedSearch {
    pub fn new(grid: ParamGrid, n_iter: usize, cv: usize, seed: u64) -> Self {
        Self {
            grid,
            n_iter,
            cv,
            seed,
        }
    }

    /// Score sampled candidates by cross-validation and refit the best one
    pub fn fit(
        &self,
        features: ArrayView2<f64>,
        targets: &[usize],
        classes: &[usize],
        feature_names: &[String],
    ) -> crate::Result<SearchResult> {
        self.grid.validate()?;
        let n_rows = features.nrows();
        if n_rows < 2 {
            return Err(SegmentationError::Training(format!(
                "cross-validation needs at least 2 training rows, got {}",
                n_rows
            )));
        }

        let folds = stratified_folds(targets, self.cv.min(n_rows).max(2));
        let candidates = self.grid.sample(self.n_iter, self.seed);
        if candidates.is_empty() {
            return Err(SegmentationError::Config(
                "search sampled no candidates, search_iterations must be positive".to_string(),
            ));
        }
        info!(
            "Searching {} candidates with {}-fold cross-validation on {} rows",
            candidates.len(),
            folds.len(),
            n_rows
        );

        let tasks: Vec<(usize, usize)> = (0..candidates.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();

        let scores: Vec<crate::Result<f64>> = tasks
            .par_iter()
            .map(|&(c, f)| -> crate::Result<f64> {
                let test_idx = &folds[f];
                let train_idx: Vec<usize> =
                    (0..n_rows).filter(|i| test_idx.binary_search(i).is_err()).collect();

                let x_train = features.select(Axis(0), &train_idx);
                let y_train: Vec<usize> = train_idx.iter().map(|&i| targets[i]).collect();
                let x_test = features.select(Axis(0), test_idx);
                let y_test: Vec<usize> = test_idx.iter().map(|&i| targets[i]).collect();

                let mut model = GradientBoostingClassifier::new(candidates[c].clone(), self.seed);
                model.fit(x_train.view(), &y_train, classes)?;
                let predicted = model.predict(x_test.view())?;
                Ok(f1_macro(&y_test, &predicted))
            })
            .collect();

        let mut fold_scores = vec![Vec::with_capacity(folds.len()); candidates.len()];
        for (&(c, _), score) in tasks.iter().zip(scores) {
            fold_scores[c].push(score?);
        }

        let scored: Vec<CandidateScore> = candidates
            .into_iter()
            .zip(fold_scores)
            .map(|(params, fold_scores)| {
                let mean_score = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
                debug!("Candidate {:?} mean F1 {:.4}", params, mean_score);
                CandidateScore {
                    params,
                    fold_scores,
                    mean_score,
                }
            })
            .collect();

        let mut best = 0;
        for (i, candidate) in scored.iter().enumerate() {
            if candidate.mean_score > scored[best].mean_score {
                best = i;
            }
        }
        let best_params = scored[best].params.clone();
        let best_score = scored[best].mean_score;
        info!("Best candidate mean F1 {:.4}: {:?}", best_score, best_params);

        let mut best_estimator = GradientBoostingClassifier::new(best_params.clone(), self.seed)
            .with_feature_names(feature_names.to_vec());
        best_estimator.fit(features, targets, classes)?;

        Ok(SearchResult {
            best_params,
            best_score,
            best_estimator,
            candidates: scored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn tiny_grid() -> ParamGrid {
        ParamGrid {
            n_estimators: vec![10, 20],
            learning_rate: vec![0.3],
            max_depth: vec![3, 4],
            num_leaves: vec![7],
            lambda_l1: vec![0.0],
            lambda_l2: vec![0.0, 0.5],
            min_data_in_leaf: vec![2],
            max_bin: vec![63],
            feature_fraction: vec![1.0],
            subsample: vec![1.0],
        }
    }

    fn separable() -> (Array2<f64>, Vec<usize>) {
        let x = Array2::from_shape_fn((30, 2), |(i, j)| {
            let class = i / 10;
            class as f64 * 10.0 + (i % 10) as f64 * 0.1 + j as f64
        });
        let y = (0..30).map(|i| i / 10).collect();
        (x, y)
    }

    #[test]
    fn test_default_grid_size() {
        assert_eq!(ParamGrid::default().size(), 4 * 3 * 2 * 2 * 2 * 2 * 2 * 2 * 2);
    }

    #[test]
    fn test_candidate_decoding_covers_grid() {
        let grid = tiny_grid();
        let all: Vec<BoosterParams> = (0..grid.size()).map(|i| grid.candidate(i)).collect();
        assert_eq!(all.len(), 8);
        assert_eq!(all[0].n_estimators, 10);
        assert_eq!(all[7].n_estimators, 20);
        assert_eq!(all[1].lambda_l2, 0.5);
        assert_eq!(all[2].max_depth, 4);
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_sample_is_distinct_and_seeded() {
        let grid = ParamGrid::default();
        let first = grid.sample(10, 0);
        assert_eq!(first.len(), 10);
        assert_eq!(first, grid.sample(10, 0));
        for (i, a) in first.iter().enumerate() {
            for b in &first[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_stratified_folds_partition_rows() {
        let targets = vec![0, 0, 0, 0, 1, 1, 1, 1, 1, 2];
        let folds = stratified_folds(&targets, 3);

        assert_eq!(folds.len(), 3);
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        for fold in &folds {
            assert!(fold.iter().any(|&i| targets[i] == 1));
        }
    }

    #[test]
    fn test_stratified_folds_drop_empty() {
        let folds = stratified_folds(&[0, 1, 1], 10);
        assert_eq!(folds.len(), 3);
    }

    #[test]
    fn test_stratified_folds_round_robin_sizes() {
        let folds = stratified_folds(&[0, 0, 0, 0, 0, 1, 1], 3);
        let sizes: Vec<usize> = folds.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
    }

    #[test]
    fn test_search_without_candidates_is_config_error() {
        let (x, y) = separable();
        let names = vec!["a".to_string(), "b".to_string()];
        let search = RandomizedSearch::new(tiny_grid(), 0, 3, 0);

        assert!(matches!(
            search.fit(x.view(), &y, &[0, 1, 2], &names),
            Err(SegmentationError::Config(_))
        ));
    }

    #[test]
    fn test_search_finds_separating_model() {
        let (x, y) = separable();
        let names = vec!["a".to_string(), "b".to_string()];
        let search = RandomizedSearch::new(tiny_grid(), 4, 3, 0);
        let result = search.fit(x.view(), &y, &[0, 1, 2], &names).unwrap();

        assert_eq!(result.candidates.len(), 4);
        assert!(result.best_score >= result.candidates.iter().map(|c| c.mean_score).fold(0.0, f64::max));
        assert_eq!(result.best_estimator.feature_names, names);
        assert_eq!(result.best_estimator.predict(x.view()).unwrap(), y);
    }

    #[test]
    fn test_search_independent_of_thread_count() {
        let (x, y) = separable();
        let names = vec!["a".to_string(), "b".to_string()];
        let search = RandomizedSearch::new(tiny_grid(), 3, 3, 1);

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let single = pool.install(|| search.fit(x.view(), &y, &[0, 1, 2], &names)).unwrap();
        let parallel = search.fit(x.view(), &y, &[0, 1, 2], &names).unwrap();

        assert_eq!(single.candidates, parallel.candidates);
        assert_eq!(single.best_params, parallel.best_params);
    }
}
