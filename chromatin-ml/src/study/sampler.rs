//! Search-space distributions and random sampling.

use crate::error::MlError;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Distribution a single hyperparameter is drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamDistribution {
    Uniform { min: f64, max: f64 },
    LogUniform { min: f64, max: f64 },
    IntRange { min: i64, max: i64 },
    Choice { values: Vec<serde_json::Value> },
}

impl ParamDistribution {
    pub fn validate(&self) -> Result<(), MlError> {
        match self {
            ParamDistribution::Uniform { min, max }
                if !(max - min).is_finite() || min > max =>
            {
                Err(MlError::invalid_input(format!(
                    "uniform range [{min}, {max}] must be finite and non-empty"
                )))
            }
            ParamDistribution::LogUniform { min, max }
                if !min.is_finite() || !max.is_finite() || *min <= 0.0 || min > max =>
            {
                Err(MlError::invalid_input(format!(
                    "log-uniform range [{min}, {max}] must be finite, positive and non-empty"
                )))
            }
            ParamDistribution::IntRange { min, max } if min > max => Err(MlError::invalid_input(
                format!("integer range [{min}, {max}] is empty"),
            )),
            ParamDistribution::Choice { values } if values.is_empty() => {
                Err(MlError::invalid_input("choice without values"))
            }
            _ => Ok(()),
        }
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamDistribution::Uniform { min, max }
            | ParamDistribution::LogUniform { min, max } => value
                .as_f64()
                .is_some_and(|v| *min <= v && v <= *max),
            ParamDistribution::IntRange { min, max } => {
                value.as_i64().is_some_and(|v| *min <= v && v <= *max)
            }
            ParamDistribution::Choice { values } => values.contains(value),
        }
    }
}

/// Independent uniform sampling over each distribution.
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    pub fn sample(&mut self, dist: &ParamDistribution) -> Result<serde_json::Value, MlError> {
        dist.validate()?;
        let value = match dist {
            ParamDistribution::Uniform { min, max } => {
                if min == max {
                    serde_json::json!(min)
                } else {
                    serde_json::json!(self.rng.gen_range(*min..*max))
                }
            }
            ParamDistribution::LogUniform { min, max } => {
                if min == max {
                    serde_json::json!(min)
                } else {
                    let log = self.rng.gen_range(min.ln()..max.ln());
                    serde_json::json!(log.exp().clamp(*min, *max))
                }
            }
            ParamDistribution::IntRange { min, max } => {
                serde_json::json!(self.rng.gen_range(*min..=*max))
            }
            ParamDistribution::Choice { values } => {
                values[self.rng.gen_range(0..values.len())].clone()
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sampler(seed: u64) -> RandomSampler {
        RandomSampler::new(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_samples_stay_in_range() {
        let dists = [
            ParamDistribution::Uniform { min: 0.1, max: 0.5 },
            ParamDistribution::LogUniform {
                min: 1e-5,
                max: 1e-2,
            },
            ParamDistribution::IntRange { min: 1, max: 4 },
            ParamDistribution::Choice {
                values: vec!["ones".into(), "eights".into()],
            },
        ];
        let mut s = sampler(7);
        for _ in 0..200 {
            for dist in &dists {
                let v = s.sample(dist).unwrap();
                assert!(dist.contains(&v), "{v} outside {dist:?}");
            }
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let dist = ParamDistribution::LogUniform {
            min: 1e-5,
            max: 1e-3,
        };
        let mut first = sampler(42);
        let mut second = sampler(42);
        let a: Vec<_> = (0..5).map(|_| first.sample(&dist).unwrap()).collect();
        let b: Vec<_> = (0..5).map(|_| second.sample(&dist).unwrap()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_distributions() {
        let mut s = sampler(0);
        assert!(s.sample(&ParamDistribution::Uniform { min: 2.0, max: 1.0 }).is_err());
        assert!(s.sample(&ParamDistribution::LogUniform { min: 0.0, max: 1.0 }).is_err());
        assert!(s.sample(&ParamDistribution::Choice { values: vec![] }).is_err());
        assert_eq!(
            s.sample(&ParamDistribution::Uniform { min: 1.0, max: 1.0 }).unwrap(),
            serde_json::json!(1.0)
        );
    }

    #[test]
    fn test_unbounded_ranges_rejected() {
        let dist: ParamDistribution =
            toml::from_str("type = \"uniform\"\nmin = 0.0\nmax = inf\n").unwrap();
        assert!(matches!(dist.validate(), Err(MlError::InvalidInput(_))));

        let mut s = sampler(3);
        let unbounded = [
            ParamDistribution::Uniform {
                min: f64::NEG_INFINITY,
                max: 1.0,
            },
            ParamDistribution::Uniform {
                min: -f64::MAX,
                max: f64::MAX,
            },
            ParamDistribution::LogUniform {
                min: 1e-5,
                max: f64::INFINITY,
            },
            ParamDistribution::LogUniform {
                min: f64::NAN,
                max: 1.0,
            },
        ];
        for dist in &unbounded {
            assert!(s.sample(dist).is_err(), "{dist:?} should be rejected");
        }
    }

    #[test]
    fn test_toml_shape() {
        let dist: ParamDistribution =
            serde_json::from_value(serde_json::json!({"type": "int_range", "min": 1, "max": 8}))
                .unwrap();
        assert_eq!(dist, ParamDistribution::IntRange { min: 1, max: 8 });
    }
}
