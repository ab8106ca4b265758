//! Training callbacks for early stopping and learning-rate monitoring.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Direction in which a monitored metric improves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

impl MonitorMode {
    /// Whether `current` beats `best` by more than `min_delta`.
    pub fn is_better(&self, current: f64, best: f64, min_delta: f64) -> bool {
        match self {
            MonitorMode::Min => current < best - min_delta,
            MonitorMode::Max => current > best + min_delta,
        }
    }

    /// Starting value every finite metric improves on.
    pub fn worst(&self) -> f64 {
        match self {
            MonitorMode::Min => f64::INFINITY,
            MonitorMode::Max => f64::NEG_INFINITY,
        }
    }
}

/// What the trainer knows at the end of an epoch.
#[derive(Debug, Clone)]
pub struct EpochContext<'a> {
    /// 0-based epoch index.
    pub epoch: usize,
    pub global_step: u64,
    pub lr: f64,
    pub metrics: &'a BTreeMap<String, f64>,
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send + Sync {
    /// Called at the end of each epoch, after validation.
    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<CallbackAction, MlError>;
}

/// Stop training when the monitored metric stops improving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub monitor: String,
    pub min_delta: f64,
    pub patience: usize,
    pub mode: MonitorMode,
    pub verbose: bool,
    #[serde(skip)]
    wait_count: usize,
    #[serde(skip)]
    best_score: Option<f64>,
    #[serde(skip)]
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(monitor: &str, min_delta: f64, patience: usize, mode: MonitorMode) -> Self {
        Self {
            monitor: monitor.to_string(),
            min_delta: min_delta.abs(),
            patience,
            mode,
            verbose: false,
            wait_count: 0,
            best_score: None,
            stopped_epoch: None,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// Feed one value of the monitored metric.
    pub fn check(&mut self, epoch: usize, current: f64) -> CallbackAction {
        if !current.is_finite() {
            tracing::warn!(
                monitor = %self.monitor,
                value = current,
                "Monitored metric is not finite, stopping"
            );
            self.stopped_epoch = Some(epoch);
            return CallbackAction::Stop;
        }

        let best = self.best_score.unwrap_or_else(|| self.mode.worst());
        if self.mode.is_better(current, best, self.min_delta) {
            if self.verbose {
                tracing::info!(
                    monitor = %self.monitor,
                    previous = best,
                    best = current,
                    "Metric improved"
                );
            }
            self.best_score = Some(current);
            self.wait_count = 0;
            return CallbackAction::Continue;
        }

        self.wait_count += 1;
        if self.wait_count >= self.patience {
            if self.verbose {
                tracing::info!(
                    monitor = %self.monitor,
                    patience = self.patience,
                    best = best,
                    "No improvement within patience, stopping"
                );
            }
            self.stopped_epoch = Some(epoch);
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

impl TrainingCallback for EarlyStopping {
    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<CallbackAction, MlError> {
        let current = ctx.metrics.get(&self.monitor).copied().ok_or_else(|| {
            MlError::training(format!(
                "early stopping monitors '{}' but it was not logged (available: {})",
                self.monitor,
                ctx.metrics.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        Ok(self.check(ctx.epoch, current))
    }
}

/// When the learning rate is logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingInterval {
    #[default]
    Epoch,
    Step,
}

/// Records the learning rate in effect for each epoch.
#[derive(Debug, Clone)]
pub struct LearningRateMonitor {
    pub interval: LoggingInterval,
    optimizer_name: String,
}

impl LearningRateMonitor {
    pub fn new(interval: LoggingInterval, optimizer_name: &str) -> Self {
        Self {
            interval,
            optimizer_name: optimizer_name.to_string(),
        }
    }

    /// Metric key, e.g. `lr-AdamW`.
    pub fn key(&self) -> String {
        format!("lr-{}", self.optimizer_name)
    }

    /// Step index and metric to log at the start of an epoch.
    pub fn on_train_epoch_start(&self, epoch: usize, global_step: u64, lr: f64) -> (u64, String, f64) {
        let step = match self.interval {
            LoggingInterval::Epoch => epoch as u64,
            LoggingInterval::Step => global_step,
        };
        (step, self.key(), lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStopping::new("val/neg_median_auroc", 0.0, 2, MonitorMode::Min);
        assert_eq!(cb.check(0, -0.70), CallbackAction::Continue); // first: sets best
        assert_eq!(cb.check(1, -0.75), CallbackAction::Continue); // improves, wait=0
        assert_eq!(cb.check(2, -0.75), CallbackAction::Continue); // equal is not better, wait=1
        assert_eq!(cb.check(3, -0.74), CallbackAction::Stop); // wait=2 >= patience
        assert_eq!(cb.stopped_epoch(), Some(3));
        assert_eq!(cb.best_score(), Some(-0.75));
    }

    #[test]
    fn test_early_stopping_min_delta_and_max_mode() {
        let mut cb = EarlyStopping::new("val/auroc", 0.01, 1, MonitorMode::Max);
        assert_eq!(cb.check(0, 0.80), CallbackAction::Continue);
        // +0.005 is within min_delta
        assert_eq!(cb.check(1, 0.805), CallbackAction::Stop);
    }

    #[test]
    fn test_early_stopping_non_finite() {
        let mut cb = EarlyStopping::new("val/loss", 0.0, 10, MonitorMode::Min);
        assert_eq!(cb.check(0, f64::NAN), CallbackAction::Stop);
    }

    #[test]
    fn test_early_stopping_missing_metric() {
        let mut cb = EarlyStopping::new("val/neg_median_auroc", 0.0, 2, MonitorMode::Min);
        let metrics = BTreeMap::from([("val/loss".to_string(), 0.3)]);
        let ctx = EpochContext {
            epoch: 0,
            global_step: 10,
            lr: 1e-3,
            metrics: &metrics,
        };
        let err = cb.on_epoch_end(&ctx).unwrap_err();
        assert!(err.to_string().contains("val/loss"));
    }

    #[test]
    fn test_lr_monitor_intervals() {
        let epoch = LearningRateMonitor::new(LoggingInterval::Epoch, "AdamW");
        assert_eq!(
            epoch.on_train_epoch_start(3, 120, 5e-5),
            (3, "lr-AdamW".to_string(), 5e-5)
        );
        let step = LearningRateMonitor::new(LoggingInterval::Step, "AdamW");
        assert_eq!(step.on_train_epoch_start(3, 120, 5e-5).0, 120);
    }
}
