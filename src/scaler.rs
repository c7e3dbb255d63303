//! Median / interquartile-range scaling

use crate::error::SegmentationError;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Robust scaler fitted per feature column.
///
/// Each value becomes `(x - median) / (q75 - q25)`; columns with zero spread
/// are divided by 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustScaler {
    pub center: Array1<f64>,
    pub scale: Array1<f64>,
}

/// Linear-interpolated quantile of already sorted values
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

fn column_stats(column: ArrayView1<f64>) -> (f64, f64) {
    let mut sorted = column.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = quantile(&sorted, 0.5);
    let iqr = quantile(&sorted, 0.75) - quantile(&sorted, 0.25);
    let scale = if iqr.abs() < f64::EPSILON { 1.0 } else { iqr };
    (median, scale)
}

impl RobustScaler {
    pub fn fit(features: &Array2<f64>) -> crate::Result<Self> {
        if features.nrows() == 0 {
            return Err(SegmentationError::EmptyDataset(
                "cannot fit a scaler on zero rows".to_string(),
            ));
        }

        let (center, scale): (Vec<f64>, Vec<f64>) =
            features.axis_iter(Axis(1)).map(column_stats).unzip();

        Ok(Self {
            center: Array1::from(center),
            scale: Array1::from(scale),
        })
    }

    pub fn transform(&self, features: &Array2<f64>) -> crate::Result<Array2<f64>> {
        if features.ncols() != self.center.len() {
            return Err(SegmentationError::Schema(format!(
                "scaler fitted on {} columns, got {}",
                self.center.len(),
                features.ncols()
            )));
        }
        Ok((features - &self.center) / &self.scale)
    }

    pub fn fit_transform(features: &Array2<f64>) -> crate::Result<(Self, Array2<f64>)> {
        let scaler = Self::fit(features)?;
        let scaled = scaler.transform(features)?;
        Ok((scaler, scaled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_median_and_iqr() {
        let features = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [4.0, 5.0], [100.0, 5.0]];
        let (scaler, scaled) = RobustScaler::fit_transform(&features).unwrap();

        assert_eq!(scaler.center, array![3.0, 5.0]);
        // q25 = 2, q75 = 4
        assert_eq!(scaler.scale, array![2.0, 1.0]);
        assert_eq!(scaled[[2, 0]], 0.0);
        assert_eq!(scaled[[4, 0]], 48.5);
        assert!(scaled.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_interpolated_quantiles() {
        let features = array![[1.0], [2.0], [3.0], [4.0]];
        let scaler = RobustScaler::fit(&features).unwrap();

        assert!((scaler.center[0] - 2.5).abs() < 1e-12);
        // q25 = 1.75, q75 = 3.25
        assert!((scaler.scale[0] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_transform_checks_width() {
        let scaler = RobustScaler::fit(&array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert!(scaler.transform(&array![[1.0]]).is_err());
    }
}
