//! K-Means segmentation with automatic selection of k

use crate::config::SegmenterConfig;
use crate::data::{LabeledProfile, ProfileTable};
use crate::error::SegmentationError;
use crate::scaler::RobustScaler;
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Fitted K-Means parameters kept as a persistable artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    /// Number of clusters
    pub n_clusters: usize,
    /// Cluster centroids in scaled space
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares (inertia)
    pub inertia: f64,
    /// Cluster assignments for the training data
    pub labels: Array1<usize>,
}

impl ClusterModel {
    /// Get cluster sizes
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in self.labels.iter() {
            if label < self.n_clusters {
                sizes[label] += 1;
            }
        }
        sizes
    }

    /// Compute basic silhouette coefficient for a subset of points (for efficiency)
    pub fn compute_silhouette_sample(&self, features: &Array2<f64>, sample_size: usize) -> f64 {
        let n_samples = features.nrows().min(sample_size);
        if n_samples < 2 {
            return 0.0;
        }

        let mut silhouette_sum = 0.0;

        for i in 0..n_samples {
            let point = features.row(i);
            let cluster_label = self.labels[i];

            let mut same_cluster_distances = Vec::new();
            let mut other_cluster_distances: Vec<Vec<f64>> = vec![Vec::new(); self.n_clusters];

            for j in 0..n_samples {
                if i == j {
                    continue;
                }

                let distance = euclidean_distance(&point, &features.row(j));
                let other_label = self.labels[j];

                if other_label == cluster_label {
                    same_cluster_distances.push(distance);
                } else if other_label < self.n_clusters {
                    other_cluster_distances[other_label].push(distance);
                }
            }

            let a_i = if same_cluster_distances.is_empty() {
                0.0
            } else {
                same_cluster_distances.iter().sum::<f64>() / same_cluster_distances.len() as f64
            };

            let b_i = other_cluster_distances
                .iter()
                .filter(|distances| !distances.is_empty())
                .map(|distances| distances.iter().sum::<f64>() / distances.len() as f64)
                .fold(f64::INFINITY, f64::min);

            let silhouette_i = if b_i.is_infinite() || (a_i == 0.0 && b_i == 0.0) {
                0.0
            } else {
                (b_i - a_i) / a_i.max(b_i)
            };

            silhouette_sum += silhouette_i;
        }

        silhouette_sum / n_samples as f64
    }
}

/// Everything the segmentation stage hands to the next stage and to storage
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Unscaled profile with a cluster label per customer
    pub labeled: LabeledProfile,
    /// Cluster count chosen by the elbow heuristic
    pub k_selected: usize,
    pub scaler: RobustScaler,
    pub cluster_model: ClusterModel,
    /// Inertia for k = 1, 2, ...
    pub distortions: Vec<f64>,
}

/// Scales a profile, picks k and assigns clusters
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Scale, select k from the distortion curve, then refit with that k
    pub fn segment(&self, profile: ProfileTable) -> crate::Result<Segmentation> {
        self.config.validate()?;
        if profile.n_features() < 2 {
            return Err(SegmentationError::InsufficientFeatures {
                required: 2,
                found: profile.n_features(),
            });
        }
        if profile.n_customers() == 0 {
            return Err(SegmentationError::EmptyDataset(
                "profile has no customers".to_string(),
            ));
        }

        let (scaler, scaled) = RobustScaler::fit_transform(&profile.features)?;

        let distortions = self.distortion_curve(&scaled)?;
        let k_selected = find_best_elbow(&distortions)?;
        info!("Selected k = {} from distortions {:?}", k_selected, distortions);

        let cluster_model = self.fit_kmeans(&scaled, k_selected)?;
        let clusters = cluster_model.labels.to_vec();
        let labeled = LabeledProfile::new(profile, clusters)?;

        Ok(Segmentation {
            labeled,
            k_selected,
            scaler,
            cluster_model,
            distortions,
        })
    }

    /// Inertia for k = 1..=n_features, capped at the number of customers
    pub fn distortion_curve(&self, scaled: &Array2<f64>) -> crate::Result<Vec<f64>> {
        let max_k = scaled.ncols().min(scaled.nrows());
        (1..=max_k)
            .map(|k| -> crate::Result<f64> {
                let model = self.fit_kmeans(scaled, k)?;
                debug!("k = {} inertia = {:.4}", k, model.inertia);
                Ok(model.inertia)
            })
            .collect()
    }

    /// Fit seeded K-Means on scaled features
    pub fn fit_kmeans(&self, scaled: &Array2<f64>, n_clusters: usize) -> crate::Result<ClusterModel> {
        if n_clusters == 0 || scaled.nrows() < n_clusters {
            return Err(SegmentationError::Clustering(format!(
                "cannot form {} clusters from {} customers",
                n_clusters,
                scaled.nrows()
            )));
        }

        let n_samples = scaled.nrows();
        let targets: Array1<usize> = Array1::zeros(n_samples);
        let dataset = Dataset::new(scaled.clone(), targets);

        let rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let model = KMeans::params_with(n_clusters, rng, L2Dist)
            .n_runs(self.config.n_runs)
            .max_n_iterations(self.config.max_iterations)
            .tolerance(self.config.tolerance)
            .fit(&dataset)
            .map_err(|e| SegmentationError::Clustering(e.to_string()))?;

        let labels: Array1<usize> = model.predict(scaled);
        let centroids = model.centroids().clone();
        let inertia = compute_inertia(scaled, &labels, &centroids);

        Ok(ClusterModel {
            n_clusters,
            centroids,
            inertia,
            labels,
        })
    }
}

/// Pick k where the distortion curve flattens.
///
/// `slope[i] = d[i+1] / d[i]`, `change[i] = slope[i+1] - slope[i]`. The
/// unmasked index with the smallest `|change|` is accepted when its change
/// is below every slope from that index on; otherwise it is masked and the
/// search continues. k is the accepted index plus 2.
pub fn find_best_elbow(distortions: &[f64]) -> crate::Result<usize> {
    let no_convergence = || SegmentationError::NoConvergence {
        distortions: distortions.to_vec(),
    };

    if distortions.len() < 3 {
        return Err(no_convergence());
    }

    let slopes: Vec<f64> = distortions.windows(2).map(|w| w[1] / w[0]).collect();
    let slope_changes: Vec<f64> = slopes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut masked = vec![false; slope_changes.len()];

    loop {
        let candidate = slope_changes
            .iter()
            .enumerate()
            .filter(|(i, _)| !masked[*i])
            .map(|(i, c)| (i, if c.is_nan() { f64::INFINITY } else { c.abs() }))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let Some((idx, _)) = candidate else {
            return Err(no_convergence());
        };

        let change = slope_changes[idx];
        if slopes[idx..].iter().all(|&slope| change < slope) {
            return Ok(idx + 2);
        }
        masked[idx] = true;
    }
}

/// Compute within-cluster sum of squares (inertia)
fn compute_inertia(features: &Array2<f64>, labels: &Array1<usize>, centroids: &Array2<f64>) -> f64 {
    let mut inertia = 0.0;

    for (i, &cluster) in labels.iter().enumerate() {
        if cluster < centroids.nrows() {
            let point = features.row(i);
            let centroid = centroids.row(cluster);
            let distance_sq = point
                .iter()
                .zip(centroid.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>();
            inertia += distance_sq;
        }
    }

    inertia
}

/// Calculate Euclidean distance between two points
fn euclidean_distance(point1: &ndarray::ArrayView1<f64>, point2: &ndarray::ArrayView1<f64>) -> f64 {
    point1
        .iter()
        .zip(point2.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Three tight groups in four dimensions
    fn blob_profile() -> ProfileTable {
        let centers = [[0.0, 0.0, 0.0, 0.0], [10.0, 10.0, 0.0, 5.0], [0.0, 20.0, 20.0, 10.0]];
        let offsets = [[0.1, -0.1, 0.05, 0.0], [-0.1, 0.1, 0.0, 0.05], [0.05, 0.0, -0.1, -0.05], [0.0, 0.05, 0.1, 0.1]];

        let mut values = Vec::new();
        let mut ids = Vec::new();
        for (c, center) in centers.iter().enumerate() {
            for (o, offset) in offsets.iter().enumerate() {
                ids.push((c * 10 + o) as i64 + 1);
                for d in 0..4 {
                    values.push(center[d] + offset[d]);
                }
            }
        }

        ProfileTable::new(
            ids,
            vec!["recency".into(), "frequency".into(), "monetary".into(), "mean_quantity".into()],
            Array2::from_shape_vec((12, 4), values).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_elbow_with_knee_at_three() {
        let distortions = [100.0, 50.0, 20.0, 8.0, 7.0, 6.5];
        assert_eq!(find_best_elbow(&distortions).unwrap(), 3);
    }

    #[test]
    fn test_elbow_masks_rejected_candidates() {
        // First candidate (index 0) fails the slope check and is masked
        let distortions = [100.0, 20.0, 18.0, 1.8, 1.7];
        assert_eq!(find_best_elbow(&distortions).unwrap(), 3);
    }

    #[test]
    fn test_elbow_without_convergence_reports_curve() {
        let distortions = [1000.0, 100.0, 30.0, 27.0];
        match find_best_elbow(&distortions) {
            Err(SegmentationError::NoConvergence { distortions: curve }) => {
                assert_eq!(curve, distortions.to_vec());
            }
            other => panic!("expected NoConvergence, got {:?}", other),
        }
    }

    #[test]
    fn test_elbow_needs_three_points() {
        assert!(matches!(
            find_best_elbow(&[10.0, 5.0]),
            Err(SegmentationError::NoConvergence { .. })
        ));
    }

    #[test]
    fn test_single_feature_is_insufficient() {
        let profile = ProfileTable::new(
            vec![1, 2, 3],
            vec!["monetary".to_string()],
            array![[1.0], [2.0], [3.0]],
        )
        .unwrap();

        let result = Segmenter::default().segment(profile);
        assert!(matches!(
            result,
            Err(SegmentationError::InsufficientFeatures { required: 2, found: 1 })
        ));
    }

    #[test]
    fn test_fit_kmeans_shapes() {
        let profile = blob_profile();
        let (_, scaled) = RobustScaler::fit_transform(&profile.features).unwrap();
        let model = Segmenter::default().fit_kmeans(&scaled, 3).unwrap();

        assert_eq!(model.n_clusters, 3);
        assert_eq!(model.labels.len(), 12);
        assert_eq!(model.centroids.shape(), &[3, 4]);
        assert_eq!(model.cluster_sizes(), vec![4, 4, 4]);
        assert!(model.inertia >= 0.0 && model.inertia.is_finite());
    }

    #[test]
    fn test_distortions_decrease_and_are_capped() {
        let profile = blob_profile();
        let (_, scaled) = RobustScaler::fit_transform(&profile.features).unwrap();
        let distortions = Segmenter::default().distortion_curve(&scaled).unwrap();

        assert_eq!(distortions.len(), 4);
        assert!(distortions[0] > distortions[2]);

        let tiny = scaled.slice(ndarray::s![0..2, ..]).to_owned();
        assert_eq!(Segmenter::default().distortion_curve(&tiny).unwrap().len(), 2);
    }

    /// Spending levels 0 and 4 form one group, 30 and 100 the other two.
    /// The remaining columns carry no signal.
    fn spending_groups_profile() -> ProfileTable {
        let levels = [0.0, 4.0, 30.0, 100.0];
        let jitter = [0.0, 0.1, -0.1, 0.05];

        let mut values = Vec::new();
        for level in levels {
            for j in jitter {
                values.extend_from_slice(&[level + j, 1.0, 2.0, 3.0]);
            }
        }

        ProfileTable::new(
            (1..=16).collect(),
            vec!["monetary".into(), "frequency".into(), "recency".into(), "mean_quantity".into()],
            Array2::from_shape_vec((16, 4), values).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_segment_selects_three_groups() {
        let segmentation = Segmenter::default().segment(spending_groups_profile()).unwrap();
        let clusters = &segmentation.labeled.clusters;

        assert_eq!(segmentation.k_selected, 3);
        assert_eq!(segmentation.distortions.len(), 4);
        assert_eq!(segmentation.labeled.distinct_clusters().len(), 3);
        assert!(clusters[..8].iter().all(|&c| c == clusters[0]));
        assert!(clusters[8..12].iter().all(|&c| c == clusters[8]));
        assert!(clusters[12..].iter().all(|&c| c == clusters[12]));
        assert_ne!(clusters[0], clusters[8]);
        assert_ne!(clusters[8], clusters[12]);
        assert_ne!(clusters[0], clusters[12]);
    }

    #[test]
    fn test_zero_runs_is_config_error() {
        let segmenter = Segmenter::new(SegmenterConfig {
            n_runs: 0,
            ..SegmenterConfig::default()
        });
        assert!(matches!(
            segmenter.segment(spending_groups_profile()),
            Err(SegmentationError::Config(_))
        ));
    }

    #[test]
    fn test_segment_is_deterministic() {
        let segmenter = Segmenter::default();
        let first = segmenter.segment(spending_groups_profile()).unwrap();
        let second = segmenter.segment(spending_groups_profile()).unwrap();

        assert_eq!(first.k_selected, second.k_selected);
        assert_eq!(first.labeled.clusters, second.labeled.clusters);
        assert_eq!(first.distortions, second.distortions);
        assert_eq!(first.labeled.profile, spending_groups_profile());
    }
}
