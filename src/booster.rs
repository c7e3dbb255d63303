//! Histogram-based gradient boosted trees for multi-class classification
//!
//! One regression tree per class and boosting round, fitted on the softmax
//! gradients. Trees grow leaf-wise up to `num_leaves`, with L1/L2
//! regularized leaf values and per-round row and feature subsampling.

use crate::error::SegmentationError;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

const MIN_SUM_HESSIAN: f64 = 1e-3;
const MIN_SPLIT_GAIN: f64 = 1e-12;

/// Booster hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoosterParams {
    /// Boosting rounds
    pub n_estimators: usize,
    /// Shrinkage applied to every leaf value
    pub learning_rate: f64,
    /// Maximum tree depth
    pub max_depth: usize,
    /// Maximum leaves per tree
    pub num_leaves: usize,
    /// L1 regularization on leaf values
    pub lambda_l1: f64,
    /// L2 regularization on leaf values
    pub lambda_l2: f64,
    /// Minimum rows on each side of a split
    pub min_data_in_leaf: usize,
    /// Maximum histogram bins per feature
    pub max_bin: usize,
    /// Share of features sampled per tree
    pub feature_fraction: f64,
    /// Share of rows sampled per boosting round
    pub subsample: f64,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 6,
            num_leaves: 31,
            lambda_l1: 0.0,
            lambda_l2: 0.0,
            min_data_in_leaf: 20,
            max_bin: 255,
            feature_fraction: 1.0,
            subsample: 1.0,
        }
    }
}

/// Quantile bin boundaries for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BinMapper {
    /// Upper bounds (inclusive) of every bin but the last
    thresholds: Vec<f64>,
}

impl BinMapper {
    fn fit(column: ArrayView1<f64>, max_bin: usize) -> Self {
        let mut sorted: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(f64::total_cmp);

        let mut distinct = sorted.clone();
        distinct.dedup();

        let cut_points: Vec<f64> = if distinct.len() <= max_bin {
            distinct
        } else {
            let mut cuts: Vec<f64> = (1..=max_bin)
                .map(|b| {
                    let pos = (b * (sorted.len() - 1)) / max_bin;
                    sorted[pos]
                })
                .collect();
            cuts.dedup();
            cuts
        };

        let thresholds = cut_points.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
        Self { thresholds }
    }

    fn n_bins(&self) -> usize {
        self.thresholds.len() + 1
    }

    fn bin(&self, value: f64) -> u16 {
        if value.is_nan() {
            return self.thresholds.len() as u16;
        }
        self.thresholds.partition_point(|&t| t < value) as u16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        bin: u16,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Regression tree over raw feature values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    fn predict_binned(&self, bins: &[Vec<u16>], row: usize) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    bin,
                    left,
                    right,
                    ..
                } => {
                    idx = if bins[*feature][row] <= *bin { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitInfo {
    feature: usize,
    bin: u16,
    gain: f64,
}

/// A leaf that may still be split
struct LeafCandidate {
    node: usize,
    rows: Vec<usize>,
    depth: usize,
    grad_sum: f64,
    hess_sum: f64,
    best: Option<SplitInfo>,
}

/// Shared inputs while growing one tree
struct GrowContext<'a> {
    params: &'a BoosterParams,
    mappers: &'a [BinMapper],
    bins: &'a [Vec<u16>],
    grad: &'a [f64],
    hess: &'a [f64],
    features: &'a [usize],
}

fn threshold_l1(g: f64, l1: f64) -> f64 {
    g.signum() * (g.abs() - l1).max(0.0)
}

impl GrowContext<'_> {
    fn leaf_score(&self, g: f64, h: f64) -> f64 {
        let t = threshold_l1(g, self.params.lambda_l1);
        t * t / (h + self.params.lambda_l2)
    }

    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        -threshold_l1(g, self.params.lambda_l1) / (h + self.params.lambda_l2)
            * self.params.learning_rate
    }

    fn candidate(&self, node: usize, rows: Vec<usize>, depth: usize) -> LeafCandidate {
        let grad_sum: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let hess_sum: f64 = rows.iter().map(|&r| self.hess[r]).sum();
        let best = if depth < self.params.max_depth {
            self.best_split(&rows, grad_sum, hess_sum)
        } else {
            None
        };
        LeafCandidate {
            node,
            rows,
            depth,
            grad_sum,
            hess_sum,
            best,
        }
    }

    fn best_split(&self, rows: &[usize], grad_sum: f64, hess_sum: f64) -> Option<SplitInfo> {
        let min_rows = self.params.min_data_in_leaf.max(1);
        if rows.len() < 2 * min_rows {
            return None;
        }

        let parent_score = self.leaf_score(grad_sum, hess_sum);
        let mut best: Option<SplitInfo> = None;

        for &feature in self.features {
            let n_bins = self.mappers[feature].n_bins();
            if n_bins < 2 {
                continue;
            }

            let mut hist = vec![(0.0f64, 0.0f64, 0usize); n_bins];
            for &r in rows {
                let slot = &mut hist[self.bins[feature][r] as usize];
                slot.0 += self.grad[r];
                slot.1 += self.hess[r];
                slot.2 += 1;
            }

            let (mut gl, mut hl, mut nl) = (0.0, 0.0, 0usize);
            for (bin, &(g, h, n)) in hist.iter().enumerate().take(n_bins - 1) {
                gl += g;
                hl += h;
                nl += n;
                let nr = rows.len() - nl;
                if nl < min_rows {
                    continue;
                }
                if nr < min_rows {
                    break;
                }
                let (gr, hr) = (grad_sum - gl, hess_sum - hl);
                if hl < MIN_SUM_HESSIAN || hr < MIN_SUM_HESSIAN {
                    continue;
                }

                let gain = self.leaf_score(gl, hl) + self.leaf_score(gr, hr) - parent_score;
                if gain > MIN_SPLIT_GAIN && best.map_or(true, |b| gain > b.gain) {
                    best = Some(SplitInfo {
                        feature,
                        bin: bin as u16,
                        gain,
                    });
                }
            }
        }

        best
    }

    /// Leaf-wise growth: always split the leaf with the largest gain
    fn grow(&self, rows: Vec<usize>) -> RegressionTree {
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut open = vec![self.candidate(0, rows, 0)];
        let mut n_leaves = 1;

        while n_leaves < self.params.num_leaves.max(1) {
            let pick = open
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.best.map(|b| (i, b.gain)))
                .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
            let Some((pick, _)) = pick else { break };

            let leaf = open.swap_remove(pick);
            let Some(split) = leaf.best else { break };

            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = leaf
                .rows
                .iter()
                .partition(|&&r| self.bins[split.feature][r] <= split.bin);

            let left = nodes.len();
            let right = left + 1;
            nodes.push(Node::Leaf { value: 0.0 });
            nodes.push(Node::Leaf { value: 0.0 });
            nodes[leaf.node] = Node::Split {
                feature: split.feature,
                bin: split.bin,
                threshold: self.mappers[split.feature].thresholds[split.bin as usize],
                left,
                right,
            };

            open.push(self.candidate(left, left_rows, leaf.depth + 1));
            open.push(self.candidate(right, right_rows, leaf.depth + 1));
            n_leaves += 1;
        }

        for leaf in open {
            nodes[leaf.node] = Node::Leaf {
                value: self.leaf_value(leaf.grad_sum, leaf.hess_sum),
            };
        }

        RegressionTree { nodes }
    }
}

/// Multi-class gradient boosted tree classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostingClassifier {
    pub params: BoosterParams,
    /// Seed for row/feature subsampling
    pub seed: u64,
    /// Class labels in score-column order
    pub classes: Vec<usize>,
    /// Names of the columns the model was trained on
    pub feature_names: Vec<String>,
    n_features: usize,
    init_scores: Vec<f64>,
    /// One tree per class for every boosting round
    trees: Vec<Vec<RegressionTree>>,
}

fn softmax_in_place(scores: &mut [f64]) {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        total += *s;
    }
    for s in scores.iter_mut() {
        *s /= total;
    }
}

impl GradientBoostingClassifier {
    pub fn new(params: BoosterParams, seed: u64) -> Self {
        Self {
            params,
            seed,
            classes: Vec::new(),
            feature_names: Vec::new(),
            n_features: 0,
            init_scores: Vec::new(),
            trees: Vec::new(),
        }
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }

    pub fn is_trained(&self) -> bool {
        !self.init_scores.is_empty()
    }

    /// Fit on `features` with labels drawn from `classes`.
    ///
    /// `classes` may contain labels absent from `targets`; they keep a
    /// near-zero prior so that every fold predicts over the same label set.
    pub fn fit(
        &mut self,
        features: ArrayView2<f64>,
        targets: &[usize],
        classes: &[usize],
    ) -> crate::Result<()> {
        let (n_rows, n_features) = features.dim();
        if n_rows == 0 || n_rows != targets.len() {
            return Err(SegmentationError::Training(format!(
                "{} rows for {} targets",
                n_rows,
                targets.len()
            )));
        }
        if classes.len() < 2 {
            return Err(SegmentationError::InsufficientClasses {
                found: classes.len(),
            });
        }

        let target_idx: Vec<usize> = targets
            .iter()
            .map(|t| {
                classes.iter().position(|c| c == t).ok_or_else(|| {
                    SegmentationError::Training(format!("label {} not among classes", t))
                })
            })
            .collect::<crate::Result<_>>()?;

        let n_classes = classes.len();
        let mappers: Vec<BinMapper> = features
            .axis_iter(Axis(1))
            .map(|col| BinMapper::fit(col, self.params.max_bin.max(2)))
            .collect();
        let bins: Vec<Vec<u16>> = features
            .axis_iter(Axis(1))
            .zip(&mappers)
            .map(|(col, mapper)| col.iter().map(|&v| mapper.bin(v)).collect())
            .collect();

        let mut counts = vec![0.0; n_classes];
        for &t in &target_idx {
            counts[t] += 1.0;
        }
        let init_scores: Vec<f64> = counts
            .iter()
            .map(|&c| (f64::max(c, 1e-6) / n_rows as f64).ln())
            .collect();

        let mut raw = Array2::from_shape_fn((n_rows, n_classes), |(_, k)| init_scores[k]);
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let hess_factor = n_classes as f64 / (n_classes as f64 - 1.0);
        let n_sampled_rows = ((self.params.subsample * n_rows as f64).round() as usize).clamp(1, n_rows);
        let n_sampled_features =
            ((self.params.feature_fraction * n_features as f64).ceil() as usize).clamp(1, n_features.max(1));

        let mut trees = Vec::with_capacity(self.params.n_estimators);
        let mut grad = vec![0.0; n_rows];
        let mut hess = vec![0.0; n_rows];

        for _ in 0..self.params.n_estimators {
            let mut probs = raw.clone();
            for mut row in probs.axis_iter_mut(Axis(0)) {
                if let Some(slice) = row.as_slice_mut() {
                    softmax_in_place(slice);
                }
            }

            let mut rows: Vec<usize> = if n_sampled_rows < n_rows {
                sample(&mut rng, n_rows, n_sampled_rows).into_vec()
            } else {
                (0..n_rows).collect()
            };
            rows.sort_unstable();

            let mut round = Vec::with_capacity(n_classes);
            for k in 0..n_classes {
                for i in 0..n_rows {
                    let p = probs[[i, k]];
                    let y = if target_idx[i] == k { 1.0 } else { 0.0 };
                    grad[i] = p - y;
                    hess[i] = (hess_factor * p * (1.0 - p)).max(1e-16);
                }

                let mut selected: Vec<usize> = if n_sampled_features < n_features {
                    sample(&mut rng, n_features, n_sampled_features).into_vec()
                } else {
                    (0..n_features).collect()
                };
                selected.sort_unstable();

                let ctx = GrowContext {
                    params: &self.params,
                    mappers: &mappers,
                    bins: &bins,
                    grad: &grad,
                    hess: &hess,
                    features: &selected,
                };
                let tree = ctx.grow(rows.clone());

                for i in 0..n_rows {
                    raw[[i, k]] += tree.predict_binned(&bins, i);
                }
                round.push(tree);
            }
            trees.push(round);
        }

        self.classes = classes.to_vec();
        self.n_features = n_features;
        self.init_scores = init_scores;
        self.trees = trees;
        Ok(())
    }

    /// Raw per-class scores
    pub fn decision_function(&self, features: ArrayView2<f64>) -> crate::Result<Array2<f64>> {
        if !self.is_trained() {
            return Err(SegmentationError::Training("model not trained".to_string()));
        }
        if features.ncols() != self.n_features {
            return Err(SegmentationError::Schema(format!(
                "model trained on {} features, got {}",
                self.n_features,
                features.ncols()
            )));
        }

        let mut raw = Array2::from_shape_fn((features.nrows(), self.classes.len()), |(_, k)| {
            self.init_scores[k]
        });
        for (i, row) in features.axis_iter(Axis(0)).enumerate() {
            for round in &self.trees {
                for (k, tree) in round.iter().enumerate() {
                    raw[[i, k]] += tree.predict(row);
                }
            }
        }
        Ok(raw)
    }

    /// Most probable class per row
    pub fn predict(&self, features: ArrayView2<f64>) -> crate::Result<Vec<usize>> {
        let raw = self.decision_function(features)?;
        Ok(raw
            .axis_iter(Axis(0))
            .map(|scores| {
                let best = scores
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |acc, (k, &s)| if s > acc.1 { (k, s) } else { acc });
                self.classes[best.0]
            })
            .collect())
    }
}
