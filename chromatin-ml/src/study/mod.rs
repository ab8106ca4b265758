//! Hyperparameter studies: trials, sampling, storage and export.

pub mod export;
pub mod sampler;
pub mod storage;
pub mod trial;

pub use export::TrialsDataFrame;
pub use sampler::{ParamDistribution, RandomSampler};
pub use storage::{SqliteStorage, StorageUrl};
pub use trial::{FrozenTrial, Trial, TrialState};

use crate::error::MlError;
use crate::training::MonitorMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};

/// Whether the objective is minimized or maximized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudyDirection {
    #[default]
    Minimize,
    Maximize,
}

impl StudyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyDirection::Minimize => "minimize",
            StudyDirection::Maximize => "maximize",
        }
    }

    /// Whether `candidate` beats `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            StudyDirection::Minimize => candidate < incumbent,
            StudyDirection::Maximize => candidate > incumbent,
        }
    }
}

impl fmt::Display for StudyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudyDirection {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimize" => Ok(StudyDirection::Minimize),
            "maximize" => Ok(StudyDirection::Maximize),
            other => Err(MlError::invalid_input(format!(
                "unknown study direction '{other}'"
            ))),
        }
    }
}

impl From<StudyDirection> for MonitorMode {
    fn from(direction: StudyDirection) -> Self {
        match direction {
            StudyDirection::Minimize => MonitorMode::Min,
            StudyDirection::Maximize => MonitorMode::Max,
        }
    }
}

/// Function being optimized. One call per trial.
#[async_trait]
pub trait Objective: Send {
    async fn evaluate(&mut self, trial: &mut Trial) -> Result<f64, MlError>;
}

/// A named study persisted in [`SqliteStorage`].
pub struct Study {
    name: String,
    direction: StudyDirection,
    study_id: i64,
    storage: SqliteStorage,
    sampler_seed: u64,
}

impl Study {
    /// Open `storage` and create (or load) the study called `name`.
    pub fn create(
        name: &str,
        storage: &StorageUrl,
        direction: StudyDirection,
        load_if_exists: bool,
    ) -> Result<Self, MlError> {
        let storage = SqliteStorage::open(storage)?;
        let study_id = storage.create_study(name, direction, load_if_exists)?;
        info!(study = name, study_id, %direction, "Study ready");
        Ok(Self {
            name: name.to_string(),
            direction,
            study_id,
            storage,
            sampler_seed: rand::random(),
        })
    }

    /// Open an existing study without creating storage or a study record.
    pub fn load(name: &str, storage: &StorageUrl) -> Result<Self, MlError> {
        let storage = SqliteStorage::open_existing(storage)?;
        let (study_id, direction) = storage.find_study(name)?;
        Ok(Self {
            name: name.to_string(),
            direction,
            study_id,
            storage,
            sampler_seed: rand::random(),
        })
    }

    /// Fix the seed trials derive their samplers from.
    pub fn with_sampler_seed(mut self, seed: u64) -> Self {
        self.sampler_seed = seed;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> StudyDirection {
        self.direction
    }

    /// Run `n_trials` trials in sequence.
    ///
    /// An objective error marks the trial `FAIL` and is returned; a
    /// non-finite value marks it `FAIL` and the study continues.
    pub async fn optimize<O: Objective + ?Sized>(
        &mut self,
        objective: &mut O,
        n_trials: usize,
    ) -> Result<(), MlError> {
        for _ in 0..n_trials {
            let (trial_id, number) = self.storage.create_trial(self.study_id)?;
            let mut trial = Trial::new(trial_id, number, self.sampler_seed);
            info!(study = %self.name, trial = number, "Trial started");

            let outcome = objective.evaluate(&mut trial).await;
            self.persist_trial(&trial)?;

            match outcome {
                Ok(value) if value.is_finite() => {
                    self.storage
                        .finish_trial(trial_id, TrialState::Complete, Some(value))?;
                    info!(trial = number, value, "Trial finished");
                }
                Ok(value) => {
                    self.storage.finish_trial(trial_id, TrialState::Fail, None)?;
                    warn!(trial = number, value, "Trial returned a non-finite value");
                }
                Err(e) => {
                    self.storage.finish_trial(trial_id, TrialState::Fail, None)?;
                    error!(trial = number, error = %e, "Trial failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn persist_trial(&self, trial: &Trial) -> Result<(), MlError> {
        for (name, value, dist) in trial.param_records() {
            self.storage
                .set_trial_param(trial.trial_id(), name, value, dist)?;
        }
        for (key, value) in trial.user_attrs() {
            self.storage.set_user_attr(trial.trial_id(), key, value)?;
        }
        Ok(())
    }

    pub fn trials(&self) -> Result<Vec<FrozenTrial>, MlError> {
        self.storage.get_all_trials(self.study_id)
    }

    /// Best completed trial; ties keep the earliest.
    pub fn best_trial(&self) -> Result<FrozenTrial, MlError> {
        let mut best: Option<FrozenTrial> = None;
        for trial in self.trials()? {
            let Some(value) = trial.value.filter(|_| trial.state == TrialState::Complete) else {
                continue;
            };
            let better = best
                .as_ref()
                .and_then(|b| b.value)
                .is_none_or(|incumbent| self.direction.improves(value, incumbent));
            if better {
                best = Some(trial);
            }
        }
        best.ok_or_else(|| {
            MlError::not_found(format!("no completed trials in study '{}'", self.name))
        })
    }

    pub fn best_params(&self) -> Result<BTreeMap<String, serde_json::Value>, MlError> {
        Ok(self.best_trial()?.params)
    }

    pub fn best_value(&self) -> Result<f64, MlError> {
        self.best_trial()?
            .value
            .ok_or_else(|| MlError::not_found("best trial has no value"))
    }

    pub fn trials_dataframe(&self) -> Result<TrialsDataFrame, MlError> {
        Ok(TrialsDataFrame::from_trials(&self.trials()?))
    }
}
