//! Training history and multi-label evaluation metrics.

use crate::error::MlError;
use crate::training::callbacks::MonitorMode;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Per-epoch history of a training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub monitor_history: Vec<f64>,
    pub lr_history: Vec<f64>,
    pub best_epoch: Option<usize>,
    pub best_value: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    /// Record one finished epoch. `best_epoch` is 1-based.
    pub fn record_epoch(&mut self, train_loss: f64, monitored: f64, lr: f64, mode: MonitorMode) {
        self.loss_history.push(train_loss);
        self.monitor_history.push(monitored);
        self.lr_history.push(lr);
        self.epochs_completed += 1;

        let improved = match self.best_value {
            None => monitored.is_finite(),
            Some(best) => mode.is_better(monitored, best, 0.0),
        };
        if improved {
            self.best_value = Some(monitored);
            self.best_epoch = Some(self.epochs_completed);
        }
    }
}

/// Model outputs on one split, row-major: one row per example, one column
/// per chromatin feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Predictions {
    #[serde(default)]
    pub loss: Option<f64>,
    pub probs: Vec<Vec<f64>>,
    pub labels: Vec<Vec<u8>>,
}

impl Predictions {
    fn validate(&self) -> Result<usize, MlError> {
        if self.probs.is_empty() {
            return Err(MlError::evaluation("no predictions"));
        }
        if self.probs.len() != self.labels.len() {
            return Err(MlError::evaluation(format!(
                "{} prediction rows but {} label rows",
                self.probs.len(),
                self.labels.len()
            )));
        }
        let n_features = self.probs[0].len();
        for (i, (p, l)) in self.probs.iter().zip(&self.labels).enumerate() {
            if p.len() != n_features || l.len() != n_features {
                return Err(MlError::evaluation(format!(
                    "row {i} has {} scores and {} labels, expected {n_features}",
                    p.len(),
                    l.len()
                )));
            }
            if p.iter().any(|v| !v.is_finite()) {
                return Err(MlError::evaluation(format!("row {i} has a non-finite score")));
            }
        }
        Ok(n_features)
    }

    /// AUROC of every feature; `None` where a feature has a single class.
    pub fn per_feature_auroc(&self) -> Result<Vec<Option<f64>>, MlError> {
        let n_features = self.validate()?;
        let mut scores = Vec::with_capacity(self.probs.len());
        let mut labels = Vec::with_capacity(self.labels.len());
        let mut out = Vec::with_capacity(n_features);
        for j in 0..n_features {
            scores.clear();
            labels.clear();
            scores.extend(self.probs.iter().map(|row| row[j]));
            labels.extend(self.labels.iter().map(|row| row[j] != 0));
            out.push(auroc(&scores, &labels));
        }
        Ok(out)
    }
}

/// Area under the ROC curve via the rank-sum statistic, ties sharing their
/// average rank. `None` when only one class is present.
pub fn auroc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    if scores.len() != labels.len() {
        return None;
    }
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(Ordering::Equal));

    let mut pos_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; the tie group i..=j shares their mean
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] {
                pos_rank_sum += avg_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Median; the mean of the two middle values for even lengths.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Negated median AUROC across features with both classes present, so that
/// lower is better.
pub fn neg_median_auroc(predictions: &Predictions) -> Result<f64, MlError> {
    let defined: Vec<f64> = predictions
        .per_feature_auroc()?
        .into_iter()
        .flatten()
        .collect();
    median(&defined)
        .map(|m| -m)
        .ok_or_else(|| MlError::evaluation("AUROC undefined for every feature"))
}
