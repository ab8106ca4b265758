//! One chromatin trial: configure, train, checkpoint and test a model.

use crate::config::{LoggerConfig, TrialRunnerConfig, TrialSettings};
use crate::data::{DataModuleSpec, PosWeightStrategy};
use crate::error::MlError;
use crate::models::{ModelArgs, ModelKind, ModelSpec};
use crate::study::{Objective, Trial};
use crate::training::{
    BackendLauncher, CheckpointManager, Devices, EarlyStopping, JsonlRunLogger,
    LearningRateMonitor, LoggingInterval, MonitorMode, ReduceLrOnPlateau, RunLogger, Trainer,
    TrainerOptions, TrainingBackend, TrainingStatus,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Optimizer name the worker reports its learning rate under.
const OPTIMIZER_NAME: &str = "AdamW";

/// Checkpoints kept in each run's manifest.
const MAX_CHECKPOINTS: usize = 5;

/// What a finished run produced.
#[derive(Debug, Clone)]
struct RunOutcome {
    checkpoint_path: PathBuf,
    epochs: usize,
    global_step: u64,
    test_metrics: BTreeMap<String, f64>,
}

/// Objective that trains one model per trial and returns its test metric.
pub struct ChromatinObjective {
    config: TrialRunnerConfig,
    launcher: Box<dyn BackendLauncher>,
    workspace: PathBuf,
}

impl ChromatinObjective {
    pub fn new(
        config: TrialRunnerConfig,
        launcher: Box<dyn BackendLauncher>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            config,
            launcher,
            workspace,
        }
    }

    pub fn config(&self) -> &TrialRunnerConfig {
        &self.config
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Draw every configured search-space parameter for `trial`.
    fn sample_params(
        &self,
        trial: &mut Trial,
    ) -> Result<Vec<(String, serde_json::Value)>, MlError> {
        self.config
            .study
            .search_space
            .iter()
            .map(|(name, dist)| trial.suggest(name, dist).map(|value| (name.clone(), value)))
            .collect()
    }

    async fn run(
        &self,
        trainer: &mut Trainer,
        backend: &mut dyn TrainingBackend,
        model: &ModelArgs,
        data: &DataModuleSpec,
        logger: &mut JsonlRunLogger,
        save_dir: &Path,
    ) -> Result<RunOutcome, MlError> {
        trainer.fit(backend, model, data, logger).await?;

        let version = logger.version();
        let checkpoint_path = trainer.save_checkpoint(backend, save_dir, &version).await?;
        let monitored = trainer.metrics().monitor_history.last().copied();
        CheckpointManager::new(logger.run_dir().to_path_buf(), MAX_CHECKPOINTS).record(
            &version,
            trainer.current_epoch(),
            trainer.global_step(),
            monitored,
            &checkpoint_path,
        )?;
        logger.log_checkpoint(&checkpoint_path)?;
        info!(path = %checkpoint_path.display(), "Checkpoint saved");

        let test_metrics = trainer.test(backend, logger).await?;
        Ok(RunOutcome {
            checkpoint_path,
            epochs: trainer.current_epoch(),
            global_step: trainer.global_step(),
            test_metrics,
        })
    }
}

#[async_trait]
impl Objective for ChromatinObjective {
    async fn evaluate(&mut self, trial: &mut Trial) -> Result<f64, MlError> {
        let mut settings = self.config.trial.clone();

        let sampled = self.sample_params(trial)?;
        apply_settings_params(&mut settings, &sampled)?;
        settings.data_path = self.resolve(&settings.data_path);

        let mut spec = ModelSpec::for_kind(settings.module, &settings);
        apply_model_params(&mut spec, &sampled)?;
        let data = DataModuleSpec::for_model(&spec, &settings);
        let prepared = data.prepare_data(&settings.metadata_columns)?;
        let pos_weight = settings.pos_weight_strategy.compute(&prepared.train)?;
        let model = spec.model_args(
            prepared.feature_names(),
            settings.pos_weight_strategy,
            pos_weight,
        )?;
        let model_json = serde_json::to_string(&model)?;
        info!(
            trial = trial.number(),
            module = %spec.kind,
            model_args = %model_json,
            "Model configured"
        );

        let devices: Devices = settings
            .devices
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        let mut trainer = Trainer::new(TrainerOptions {
            max_epochs: spec.max_epochs,
            devices,
            precision: settings.precision,
            strategy: settings.strategy.clone(),
            accumulate_grad_batches: spec.accumulate_grad_batches,
            seed: settings.seed,
            monitor: settings.monitor.clone(),
            monitor_mode: MonitorMode::Min,
        })
        .with_callback(Box::new(
            EarlyStopping::new(
                &settings.monitor,
                0.0,
                spec.early_stopping_patience(),
                MonitorMode::Min,
            )
            .verbose(true),
        ))
        .with_lr_monitor(LearningRateMonitor::new(LoggingInterval::Epoch, OPTIMIZER_NAME))
        .with_scheduler(ReduceLrOnPlateau::new(
            spec.lr,
            MonitorMode::Min,
            spec.reduce_lr_on_plateau_patience,
        ));

        let logger_config = LoggerConfig {
            save_dir: self.resolve(&self.config.logger.save_dir),
            ..self.config.logger.clone()
        };
        let mut logger = JsonlRunLogger::create(&logger_config)?;
        logger.log_hyperparams(&serde_json::json!({
            "model": &model,
            "data": &data,
            "trainer": trainer.trainer_args(),
            "trial": trial.number(),
            "params": trial.params(),
        }))?;

        let mut backend = match self.launcher.launch(settings.seed).await {
            Ok(backend) => backend,
            Err(e) => {
                if let Err(fe) = logger.finalize(TrainingStatus::Failed) {
                    warn!(error = %fe, "Failed to close run");
                }
                return Err(e);
            }
        };

        let result = self
            .run(
                &mut trainer,
                backend.as_mut(),
                &model,
                &data,
                &mut logger,
                &logger_config.save_dir,
            )
            .await;
        let shutdown = backend.shutdown().await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(se) = shutdown {
                    warn!(error = %se, "Worker shutdown failed");
                }
                if let Err(fe) = logger.finalize(TrainingStatus::Failed) {
                    warn!(error = %fe, "Failed to close run");
                }
                return Err(e);
            }
        };
        if let Err(e) = shutdown {
            warn!(error = %e, "Worker shutdown failed");
        }
        logger.finalize(TrainingStatus::Completed)?;

        trial.set_user_attr(
            "checkpoint_path",
            outcome.checkpoint_path.display().to_string(),
        );
        trial.set_user_attr("module", spec.kind.as_str());
        trial.set_user_attr("epochs", outcome.epochs);
        trial.set_user_attr("global_step", outcome.global_step);
        trial.set_user_attr("run_version", logger.version());

        let value = outcome
            .test_metrics
            .get(&settings.test_metric)
            .copied()
            .ok_or_else(|| {
                MlError::evaluation(format!(
                    "test metric '{}' was not produced",
                    settings.test_metric
                ))
            })?;
        info!(trial = trial.number(), metric = %settings.test_metric, value, "Trial evaluated");
        Ok(value)
    }
}

/// Apply sampled parameters that change trial settings.
fn apply_settings_params(
    settings: &mut TrialSettings,
    sampled: &[(String, serde_json::Value)],
) -> Result<(), MlError> {
    for (name, value) in sampled {
        match name.as_str() {
            "module" => {
                settings.module = as_str(name, value)?.parse::<ModelKind>()?;
            }
            "pos_weight_strategy" => {
                settings.pos_weight_strategy =
                    serde_json::from_value::<PosWeightStrategy>(value.clone())?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Apply sampled parameters that override the architecture preset.
fn apply_model_params(
    spec: &mut ModelSpec,
    sampled: &[(String, serde_json::Value)],
) -> Result<(), MlError> {
    for (name, value) in sampled {
        match name.as_str() {
            "module" | "pos_weight_strategy" => {}
            "lr" => spec.lr = as_f64(name, value)?,
            "batch_size" => spec.batch_size = as_usize(name, value)?,
            "accumulate_grad_batches" => spec.accumulate_grad_batches = as_usize(name, value)?,
            "max_epochs" => spec.max_epochs = as_usize(name, value)?,
            "reduce_lr_on_plateau_patience" => {
                spec.reduce_lr_on_plateau_patience = as_usize(name, value)?
            }
            other => {
                return Err(MlError::invalid_input(format!(
                    "search space parameter '{other}' does not map to a trial setting"
                )));
            }
        }
    }
    Ok(())
}

fn as_str<'a>(name: &str, value: &'a serde_json::Value) -> Result<&'a str, MlError> {
    value
        .as_str()
        .ok_or_else(|| MlError::invalid_input(format!("parameter '{name}' must be a string")))
}

fn as_f64(name: &str, value: &serde_json::Value) -> Result<f64, MlError> {
    value
        .as_f64()
        .ok_or_else(|| MlError::invalid_input(format!("parameter '{name}' must be a number")))
}

fn as_usize(name: &str, value: &serde_json::Value) -> Result<usize, MlError> {
    value
        .as_u64()
        .filter(|v| *v > 0 || name == "reduce_lr_on_plateau_patience")
        .map(|v| v as usize)
        .ok_or_else(|| {
            MlError::invalid_input(format!("parameter '{name}' must be a positive integer"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sampled_module_switches_preset() {
        let mut settings = TrialSettings::default();
        apply_settings_params(&mut settings, &[("module".into(), json!("deepsea"))]).unwrap();
        assert_eq!(settings.module, ModelKind::DeepSea);
        let spec = ModelSpec::for_kind(settings.module, &settings);
        assert_eq!(spec.batch_size, 256);
    }

    #[test]
    fn test_sampled_overrides_apply_to_preset() {
        let settings = TrialSettings::default();
        let mut spec = ModelSpec::for_kind(ModelKind::Gpn, &settings);
        let sampled = vec![
            ("lr".to_string(), json!(1e-4)),
            ("reduce_lr_on_plateau_patience".to_string(), json!(0)),
            ("accumulate_grad_batches".to_string(), json!(4)),
        ];
        apply_model_params(&mut spec, &sampled).unwrap();
        assert_eq!(spec.lr, 1e-4);
        assert_eq!(spec.accumulate_grad_batches, 4);
        assert_eq!(spec.early_stopping_patience(), 2);
    }

    #[test]
    fn test_unknown_or_mistyped_params_rejected() {
        let settings = TrialSettings::default();
        let mut spec = ModelSpec::for_kind(ModelKind::Gpn, &settings);
        assert!(apply_model_params(&mut spec, &[("dropout".into(), json!(0.1))]).is_err());
        assert!(apply_model_params(&mut spec, &[("batch_size".into(), json!(0))]).is_err());
        assert!(apply_model_params(&mut spec, &[("lr".into(), json!("fast"))]).is_err());
    }
}
