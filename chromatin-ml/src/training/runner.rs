//! The trainer loop.

use crate::data::{DataModuleSpec, Split};
use crate::error::MlError;
use crate::models::ModelArgs;
use crate::runtime::TrainerArgs;
use crate::training::backend::TrainingBackend;
use crate::training::callbacks::{
    CallbackAction, EpochContext, LearningRateMonitor, MonitorMode, TrainingCallback,
};
use crate::training::checkpoint::checkpoint_path;
use crate::training::experiment::RunLogger;
use crate::training::metrics::{TrainingMetrics, neg_median_auroc};
use crate::training::scheduler::ReduceLrOnPlateau;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Compute devices requested for training.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Devices {
    /// Let the worker decide.
    #[default]
    Auto,
    /// Every visible accelerator.
    All,
    Count(usize),
    /// Explicit device indices.
    List(Vec<usize>),
}

impl Devices {
    /// Representation sent to the worker.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Devices::Auto => serde_json::Value::Null,
            Devices::All => serde_json::json!(-1),
            Devices::Count(n) => serde_json::json!(n),
            Devices::List(ids) => serde_json::json!(ids),
        }
    }
}

impl FromStr for Devices {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || MlError::invalid_input(format!("invalid device selection '{s}'"));
        match s {
            "" | "auto" | "None" => Ok(Devices::Auto),
            "-1" => Ok(Devices::All),
            _ if s.contains(',') => s
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| id.parse::<usize>().map_err(|_| invalid()))
                .collect::<Result<Vec<_>, _>>()
                .map(Devices::List),
            _ => s.parse::<usize>().map(Devices::Count).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Auto => f.write_str("auto"),
            Devices::All => f.write_str("-1"),
            Devices::Count(n) => write!(f, "{n}"),
            // a lone index keeps its comma so it does not read back as a count
            Devices::List(ids) if ids.len() == 1 => write!(f, "{},", ids[0]),
            Devices::List(ids) => {
                let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                f.write_str(&ids.join(","))
            }
        }
    }
}

/// Static trainer settings.
#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub max_epochs: usize,
    pub devices: Devices,
    pub precision: u8,
    pub strategy: String,
    pub accumulate_grad_batches: usize,
    pub seed: u64,
    /// Metric driving the scheduler and `best_epoch` bookkeeping.
    pub monitor: String,
    pub monitor_mode: MonitorMode,
}

/// Drives a [`TrainingBackend`] through fit and test.
pub struct Trainer {
    options: TrainerOptions,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    lr_monitor: Option<LearningRateMonitor>,
    scheduler: Option<ReduceLrOnPlateau>,
    current_epoch: usize,
    global_step: u64,
    metrics: TrainingMetrics,
}

impl Trainer {
    pub fn new(options: TrainerOptions) -> Self {
        Self {
            options,
            callbacks: Vec::new(),
            lr_monitor: None,
            scheduler: None,
            current_epoch: 0,
            global_step: 0,
            metrics: TrainingMetrics::default(),
        }
    }

    pub fn with_callback(mut self, callback: Box<dyn TrainingCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_lr_monitor(mut self, monitor: LearningRateMonitor) -> Self {
        self.lr_monitor = Some(monitor);
        self
    }

    pub fn with_scheduler(mut self, scheduler: ReduceLrOnPlateau) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn options(&self) -> &TrainerOptions {
        &self.options
    }

    /// Number of epochs completed.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Optimizer steps taken, as reported by the backend.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn trainer_args(&self) -> TrainerArgs {
        TrainerArgs {
            max_epochs: self.options.max_epochs,
            devices: self.options.devices.to_json(),
            precision: self.options.precision,
            strategy: self.options.strategy.clone(),
            accumulate_grad_batches: self.options.accumulate_grad_batches,
            seed: self.options.seed,
        }
    }

    /// Train until `max_epochs` or until a callback asks to stop.
    pub async fn fit(
        &mut self,
        backend: &mut dyn TrainingBackend,
        model: &ModelArgs,
        data: &DataModuleSpec,
        logger: &mut dyn RunLogger,
    ) -> Result<&TrainingMetrics, MlError> {
        let started = Instant::now();
        backend.setup(model, data, &self.trainer_args()).await?;

        let mut lr = self.scheduler.as_ref().map_or(model.lr, |s| s.lr());
        info!(
            max_epochs = self.options.max_epochs,
            devices = %self.options.devices,
            precision = self.options.precision,
            strategy = %self.options.strategy,
            accumulate_grad_batches = self.options.accumulate_grad_batches,
            "Starting fit"
        );

        for epoch in 0..self.options.max_epochs {
            if let Some(monitor) = &self.lr_monitor {
                let (step, key, value) = monitor.on_train_epoch_start(epoch, self.global_step, lr);
                logger.log_metrics(step, &BTreeMap::from([(key, value)]))?;
            }

            let outcome = backend.train_epoch(epoch, lr).await?;
            if !outcome.train_loss.is_finite() {
                warn!(epoch, loss = outcome.train_loss, "Non-finite training loss");
            }
            self.global_step = outcome.global_step;

            let validation = backend.predict(Split::Validation).await?;
            let mut logged = BTreeMap::new();
            logged.insert("epoch".to_string(), epoch as f64);
            logged.insert("train/loss".to_string(), outcome.train_loss);
            if let Some(loss) = validation.loss {
                logged.insert("val/loss".to_string(), loss);
            }
            logged.insert("val/neg_median_auroc".to_string(), neg_median_auroc(&validation)?);
            logger.log_metrics(self.global_step, &logged)?;

            let monitored = logged.get(&self.options.monitor).copied().ok_or_else(|| {
                MlError::training(format!(
                    "monitored metric '{}' is not produced by validation",
                    self.options.monitor
                ))
            })?;
            self.metrics
                .record_epoch(outcome.train_loss, monitored, lr, self.options.monitor_mode);
            self.current_epoch = epoch + 1;
            debug!(
                epoch,
                global_step = self.global_step,
                train_loss = outcome.train_loss,
                monitored,
                lr,
                "Epoch finished"
            );

            let ctx = EpochContext {
                epoch,
                global_step: self.global_step,
                lr,
                metrics: &logged,
            };
            let mut stop = false;
            for callback in &mut self.callbacks {
                if callback.on_epoch_end(&ctx)? == CallbackAction::Stop {
                    stop = true;
                }
            }

            if let Some(scheduler) = &mut self.scheduler {
                scheduler.step(monitored);
                lr = scheduler.lr();
            }

            if stop {
                info!(epoch, "Training stopped early");
                break;
            }
        }

        self.metrics.total_training_time_secs = started.elapsed().as_secs_f64();
        info!(
            epochs = self.current_epoch,
            global_step = self.global_step,
            best_epoch = ?self.metrics.best_epoch,
            best_value = ?self.metrics.best_value,
            "Fit finished"
        );
        Ok(&self.metrics)
    }

    /// Save weights at `<save_dir>/version_<v>/epoch_<e>-step_<s>.ckpt`.
    pub async fn save_checkpoint(
        &self,
        backend: &mut dyn TrainingBackend,
        save_dir: &Path,
        version: &str,
    ) -> Result<PathBuf, MlError> {
        let path = checkpoint_path(save_dir, version, self.current_epoch, self.global_step);
        backend.save_checkpoint(&path).await?;
        Ok(path)
    }

    /// Evaluate the test split.
    pub async fn test(
        &self,
        backend: &mut dyn TrainingBackend,
        logger: &mut dyn RunLogger,
    ) -> Result<BTreeMap<String, f64>, MlError> {
        let predictions = backend.predict(Split::Test).await?;
        let mut results = BTreeMap::new();
        if let Some(loss) = predictions.loss {
            results.insert("test/loss".to_string(), loss);
        }
        results.insert("test/neg_median_auroc".to_string(), neg_median_auroc(&predictions)?);
        logger.log_metrics(self.global_step, &results)?;
        for (name, value) in &results {
            info!(metric = %name, value, "Test result");
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert_eq!("".parse::<Devices>().unwrap(), Devices::Auto);
        assert_eq!("-1".parse::<Devices>().unwrap(), Devices::All);
        assert_eq!("2".parse::<Devices>().unwrap(), Devices::Count(2));
        assert_eq!("0,3".parse::<Devices>().unwrap(), Devices::List(vec![0, 3]));
        assert_eq!("1,".parse::<Devices>().unwrap(), Devices::List(vec![1]));
        assert!("two".parse::<Devices>().is_err());
        assert!("-2".parse::<Devices>().is_err());
    }

    #[test]
    fn test_devices_display_reparses() {
        assert_eq!(Devices::List(vec![0, 3]).to_string(), "0,3");
        assert_eq!(Devices::List(vec![1]).to_string(), "1,");
        for devices in [
            Devices::Auto,
            Devices::All,
            Devices::Count(2),
            Devices::List(vec![1]),
            Devices::List(vec![0, 3]),
        ] {
            assert_eq!(devices.to_string().parse::<Devices>().unwrap(), devices);
        }
    }

    #[test]
    fn test_devices_json() {
        assert_eq!(Devices::Auto.to_json(), serde_json::Value::Null);
        assert_eq!(Devices::All.to_json(), serde_json::json!(-1));
        assert_eq!(Devices::List(vec![0, 1]).to_json(), serde_json::json!([0, 1]));
    }
}
