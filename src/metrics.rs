//! Macro-averaged classification metrics

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-label confusion counts
#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    tp: usize,
    fp: usize,
    fn_: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Counts for every label seen in either vector, sorted by label
fn confusion(y_true: &[usize], y_pred: &[usize]) -> Vec<Counts> {
    let labels: BTreeSet<usize> = y_true.iter().chain(y_pred).copied().collect();
    labels
        .into_iter()
        .map(|label| {
            let mut c = Counts::default();
            for (&t, &p) in y_true.iter().zip(y_pred) {
                match (t == label, p == label) {
                    (true, true) => c.tp += 1,
                    (false, true) => c.fp += 1,
                    (true, false) => c.fn_ += 1,
                    (false, false) => {}
                }
            }
            c
        })
        .collect()
}

fn macro_mean(counts: &[Counts], f: impl Fn(&Counts) -> f64) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    counts.iter().map(f).sum::<f64>() / counts.len() as f64
}

/// Macro F1 over the union of true and predicted labels; undefined ratios count as 0
pub fn f1_macro(y_true: &[usize], y_pred: &[usize]) -> f64 {
    macro_mean(&confusion(y_true, y_pred), |c| ratio(2 * c.tp, 2 * c.tp + c.fp + c.fn_))
}

pub fn precision_macro(y_true: &[usize], y_pred: &[usize]) -> f64 {
    macro_mean(&confusion(y_true, y_pred), |c| ratio(c.tp, c.tp + c.fp))
}

pub fn recall_macro(y_true: &[usize], y_pred: &[usize]) -> f64 {
    macro_mean(&confusion(y_true, y_pred), |c| ratio(c.tp, c.tp + c.fn_))
}

pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    ratio(correct, y_true.len())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Hold-out evaluation of the interpreter, stored in the control file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Run date
    pub date: NaiveDate,
    pub f1_score_macro: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    /// Filled in by the storage layer
    pub interpreter_model: Option<String>,
    pub interpreter_model_version: Option<u32>,
    pub interpreter_train_date: Option<NaiveDate>,
}

impl EvalMetrics {
    /// Score predictions, rounding to `decimals` places, dated today
    pub fn from_predictions(y_true: &[usize], y_pred: &[usize], decimals: i32) -> Self {
        Self {
            date: Local::now().date_naive(),
            f1_score_macro: round_to(f1_macro(y_true, y_pred), decimals),
            accuracy: round_to(accuracy(y_true, y_pred), decimals),
            precision: round_to(precision_macro(y_true, y_pred), decimals),
            recall: round_to(recall_macro(y_true, y_pred), decimals),
            interpreter_model: None,
            interpreter_model_version: None,
            interpreter_train_date: None,
        }
    }
}
