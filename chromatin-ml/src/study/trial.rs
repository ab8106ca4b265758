//! Live and finished trials.

use crate::error::MlError;
use crate::study::sampler::{ParamDistribution, RandomSampler};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialState {
    Running,
    Complete,
    Fail,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::Running => "RUNNING",
            TrialState::Complete => "COMPLETE",
            TrialState::Fail => "FAIL",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(TrialState::Running),
            "COMPLETE" => Ok(TrialState::Complete),
            "FAIL" => Ok(TrialState::Fail),
            other => Err(MlError::study(format!("unknown trial state '{other}'"))),
        }
    }
}

/// A trial handed to the objective.
pub struct Trial {
    trial_id: i64,
    number: usize,
    sampler: RandomSampler,
    params: BTreeMap<String, (serde_json::Value, ParamDistribution)>,
    user_attrs: BTreeMap<String, serde_json::Value>,
}

impl Trial {
    pub fn new(trial_id: i64, number: usize, sampler_seed: u64) -> Self {
        let seed = sampler_seed.wrapping_add(number as u64);
        Self {
            trial_id,
            number,
            sampler: RandomSampler::new(StdRng::seed_from_u64(seed)),
            params: BTreeMap::new(),
            user_attrs: BTreeMap::new(),
        }
    }

    pub fn trial_id(&self) -> i64 {
        self.trial_id
    }

    /// 0-based position of this trial within its study.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Draw `name` from `dist`. Asking twice for the same name returns the
    /// first value.
    pub fn suggest(
        &mut self,
        name: &str,
        dist: &ParamDistribution,
    ) -> Result<serde_json::Value, MlError> {
        if let Some((value, previous)) = self.params.get(name) {
            if previous != dist {
                return Err(MlError::invalid_input(format!(
                    "parameter '{name}' suggested again with a different distribution"
                )));
            }
            return Ok(value.clone());
        }
        let value = self.sampler.sample(dist)?;
        self.params
            .insert(name.to_string(), (value.clone(), dist.clone()));
        Ok(value)
    }

    pub fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        log: bool,
    ) -> Result<f64, MlError> {
        let dist = if log {
            ParamDistribution::LogUniform { min: low, max: high }
        } else {
            ParamDistribution::Uniform { min: low, max: high }
        };
        self.suggest(name, &dist)?
            .as_f64()
            .ok_or_else(|| MlError::study(format!("parameter '{name}' is not a float")))
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, MlError> {
        self.suggest(name, &ParamDistribution::IntRange { min: low, max: high })?
            .as_i64()
            .ok_or_else(|| MlError::study(format!("parameter '{name}' is not an integer")))
    }

    pub fn suggest_categorical(
        &mut self,
        name: &str,
        choices: &[serde_json::Value],
    ) -> Result<serde_json::Value, MlError> {
        self.suggest(
            name,
            &ParamDistribution::Choice {
                values: choices.to_vec(),
            },
        )
    }

    pub fn set_user_attr(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.user_attrs.insert(key.to_string(), value.into());
    }

    pub fn params(&self) -> BTreeMap<String, serde_json::Value> {
        self.params
            .iter()
            .map(|(name, (value, _))| (name.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn param_records(
        &self,
    ) -> impl Iterator<Item = (&String, &serde_json::Value, &ParamDistribution)> {
        self.params
            .iter()
            .map(|(name, (value, dist))| (name, value, dist))
    }

    pub fn user_attrs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.user_attrs
    }
}

/// A trial as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub trial_id: i64,
    pub number: usize,
    pub state: TrialState,
    pub value: Option<f64>,
    pub params: BTreeMap<String, serde_json::Value>,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub datetime_start: DateTime<Utc>,
    pub datetime_complete: Option<DateTime<Utc>>,
}

impl FrozenTrial {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.datetime_complete.map(|end| end - self.datetime_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_is_memoized() {
        let mut trial = Trial::new(1, 0, 42);
        let lr = trial.suggest_float("lr", 1e-5, 1e-3, true).unwrap();
        assert_eq!(trial.suggest_float("lr", 1e-5, 1e-3, true).unwrap(), lr);
        assert!(trial.suggest_float("lr", 1e-5, 1e-3, false).is_err());
        assert_eq!(trial.params().len(), 1);
    }

    #[test]
    fn test_trials_with_same_number_draw_same_values() {
        let mut a = Trial::new(1, 3, 42);
        let mut b = Trial::new(9, 3, 42);
        assert_eq!(
            a.suggest_int("patience", 0, 5).unwrap(),
            b.suggest_int("patience", 0, 5).unwrap()
        );
    }

    #[test]
    fn test_suggest_categorical() {
        let mut trial = Trial::new(1, 0, 0);
        let choices = vec![serde_json::json!("GPN"), serde_json::json!("DeepSEA")];
        let picked = trial.suggest_categorical("module", &choices).unwrap();
        assert!(choices.contains(&picked));
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [TrialState::Running, TrialState::Complete, TrialState::Fail] {
            assert_eq!(state.as_str().parse::<TrialState>().unwrap(), state);
        }
        assert!("PRUNED".parse::<TrialState>().is_err());
    }
}
