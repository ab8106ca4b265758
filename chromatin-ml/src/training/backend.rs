//! Seam between the trainer loop and whatever executes the model.

use crate::data::{DataModuleSpec, Split};
use crate::error::MlError;
use crate::models::ModelArgs;
use crate::runtime::{TrainerArgs, WorkerProcess, WorkerRequest, WorkerRuntime};
use crate::training::metrics::Predictions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Result of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochOutcome {
    pub train_loss: f64,
    /// Optimizer steps taken since the start of training.
    pub global_step: u64,
}

/// Executes model construction, optimization and inference.
#[async_trait]
pub trait TrainingBackend: Send {
    /// Build the model and data pipeline.
    async fn setup(
        &mut self,
        model: &ModelArgs,
        data: &DataModuleSpec,
        trainer: &TrainerArgs,
    ) -> Result<(), MlError>;

    /// Train one epoch at learning rate `lr`.
    async fn train_epoch(&mut self, epoch: usize, lr: f64) -> Result<EpochOutcome, MlError>;

    /// Run inference over a split.
    async fn predict(&mut self, split: Split) -> Result<Predictions, MlError>;

    /// Serialize the current weights to `path`.
    async fn save_checkpoint(&mut self, path: &Path) -> Result<(), MlError>;

    /// Release the backend's resources.
    async fn shutdown(self: Box<Self>) -> Result<(), MlError>;
}

/// Creates one backend per trial.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, seed: u64) -> Result<Box<dyn TrainingBackend>, MlError>;
}

/// Backend driving the external training worker.
pub struct WorkerBackend {
    process: WorkerProcess,
}

impl WorkerBackend {
    pub fn new(process: WorkerProcess) -> Self {
        Self { process }
    }
}

#[async_trait]
impl TrainingBackend for WorkerBackend {
    async fn setup(
        &mut self,
        model: &ModelArgs,
        data: &DataModuleSpec,
        trainer: &TrainerArgs,
    ) -> Result<(), MlError> {
        self.process
            .request(&WorkerRequest::Setup {
                model,
                data,
                trainer,
            })
            .await?;
        Ok(())
    }

    async fn train_epoch(&mut self, epoch: usize, lr: f64) -> Result<EpochOutcome, MlError> {
        let response = self
            .process
            .request(&WorkerRequest::TrainEpoch { epoch, lr })
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn predict(&mut self, split: Split) -> Result<Predictions, MlError> {
        let response = self.process.request(&WorkerRequest::Predict { split }).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn save_checkpoint(&mut self, path: &Path) -> Result<(), MlError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.process
            .request(&WorkerRequest::SaveCheckpoint { path })
            .await?;
        Ok(())
    }

    async fn shutdown(self: Box<Self>) -> Result<(), MlError> {
        self.process.shutdown().await
    }
}

/// Launches a [`WorkerBackend`] through a [`WorkerRuntime`].
pub struct WorkerLauncher {
    runtime: WorkerRuntime,
}

impl WorkerLauncher {
    pub fn new(runtime: WorkerRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl BackendLauncher for WorkerLauncher {
    async fn launch(&self, seed: u64) -> Result<Box<dyn TrainingBackend>, MlError> {
        let process = self.runtime.spawn(seed).await?;
        Ok(Box::new(WorkerBackend::new(process)))
    }
}
