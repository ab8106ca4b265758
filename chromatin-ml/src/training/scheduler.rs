//! Learning-rate scheduling on a validation metric plateau.

use crate::training::callbacks::MonitorMode;
use serde::{Deserialize, Serialize};

/// How the improvement threshold is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    #[default]
    Rel,
    Abs,
}

/// Multiply the learning rate by `factor` once the monitored metric has not
/// improved for more than `patience` epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    pub mode: MonitorMode,
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub threshold_mode: ThresholdMode,
    pub cooldown: usize,
    pub min_lr: f64,
    pub eps: f64,
    lr: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, mode: MonitorMode, patience: usize) -> Self {
        Self {
            mode,
            factor: 0.1,
            patience,
            threshold: 1e-4,
            threshold_mode: ThresholdMode::Rel,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
            lr: initial_lr,
            best: mode.worst(),
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Learning rate for the next epoch.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    fn is_better(&self, current: f64) -> bool {
        match (self.mode, self.threshold_mode) {
            (MonitorMode::Min, ThresholdMode::Rel) => current < self.best * (1.0 - self.threshold),
            (MonitorMode::Min, ThresholdMode::Abs) => current < self.best - self.threshold,
            (MonitorMode::Max, ThresholdMode::Rel) => current > self.best * (1.0 + self.threshold),
            (MonitorMode::Max, ThresholdMode::Abs) => current > self.best + self.threshold,
        }
    }

    /// Feed the epoch's monitored value; returns `true` when the rate was cut.
    pub fn step(&mut self, current: f64) -> bool {
        if self.is_better(current) {
            self.best = current;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            let reduced = self.reduce_lr();
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
            return reduced;
        }
        false
    }

    fn reduce_lr(&mut self) -> bool {
        let new_lr = (self.lr * self.factor).max(self.min_lr);
        if self.lr - new_lr > self.eps {
            tracing::info!(old_lr = self.lr, new_lr, "Reducing learning rate");
            self.lr = new_lr;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_patience_reduces_on_first_stall() {
        let mut sched = ReduceLrOnPlateau::new(5e-5, MonitorMode::Min, 0);
        assert!(!sched.step(-0.70));
        assert!(!sched.step(-0.72));
        assert!(sched.step(-0.71));
        assert!((sched.lr() - 5e-6).abs() < 1e-18);
    }

    #[test]
    fn test_patience_one() {
        let mut sched = ReduceLrOnPlateau::new(1e-3, MonitorMode::Min, 1);
        assert!(!sched.step(0.5));
        assert!(!sched.step(0.6)); // bad = 1, not > 1
        assert!(sched.step(0.6)); // bad = 2
        assert!((sched.lr() - 1e-4).abs() < 1e-15);
        assert_eq!(sched.num_bad_epochs(), 0);
    }

    #[test]
    fn test_relative_threshold() {
        let mut sched = ReduceLrOnPlateau::new(1.0, MonitorMode::Min, 0);
        sched.step(1.0);
        // 0.99995 is within 1e-4 relative of 1.0
        assert!(sched.step(0.99995));
    }

    #[test]
    fn test_min_lr_floor_and_eps() {
        let mut sched = ReduceLrOnPlateau::new(1e-3, MonitorMode::Min, 0).with_min_lr(5e-4);
        sched.step(1.0);
        assert!(sched.step(1.0));
        assert_eq!(sched.lr(), 5e-4);
        // already at the floor
        assert!(!sched.step(1.0));
        assert_eq!(sched.lr(), 5e-4);
    }

    #[test]
    fn test_cooldown_suppresses_bad_epochs() {
        let mut sched = ReduceLrOnPlateau::new(1.0, MonitorMode::Max, 0).with_cooldown(2);
        sched.step(0.5);
        assert!(sched.step(0.4));
        assert!(!sched.step(0.4));
        assert!(!sched.step(0.4));
        assert!(sched.step(0.4));
        assert!((sched.lr() - 0.01).abs() < 1e-12);
    }
}
