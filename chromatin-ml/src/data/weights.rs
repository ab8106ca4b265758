//! Positive-class weighting for the multi-label BCE loss.

use crate::data::source::LabelTable;
use crate::error::MlError;
use serde::{Deserialize, Serialize};

/// How the per-feature positive weight is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosWeightStrategy {
    /// Every feature weighted 1.
    Ones,
    /// Every feature weighted 8.
    Eights,
    /// `sqrt((1 - p) / p)` with `p` the positive frequency in the train split.
    #[default]
    SqrtInvFreq,
}

impl PosWeightStrategy {
    pub fn compute(&self, table: &LabelTable) -> Result<Vec<f64>, MlError> {
        let n_features = table.feature_names().len();
        match self {
            PosWeightStrategy::Ones => Ok(vec![1.0; n_features]),
            PosWeightStrategy::Eights => Ok(vec![8.0; n_features]),
            PosWeightStrategy::SqrtInvFreq => {
                let freq = table.positive_frequency()?;
                sqrt_inv_freq(&table.feature_names(), &freq)
            }
        }
    }
}

/// Weight each feature by the square root of its negative/positive ratio.
pub fn sqrt_inv_freq(feature_names: &[String], freq: &[f64]) -> Result<Vec<f64>, MlError> {
    let degenerate: Vec<&str> = feature_names
        .iter()
        .zip(freq)
        .filter(|(_, p)| **p <= 0.0 || **p >= 1.0)
        .map(|(name, _)| name.as_str())
        .collect();
    if !degenerate.is_empty() {
        return Err(MlError::dataset(format!(
            "positive weight undefined for features with a single class: {}",
            degenerate.join(", ")
        )));
    }
    Ok(freq.iter().map(|p| ((1.0 - p) / p).sqrt()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn table(content: &str) -> LabelTable {
        LabelTable::parse(Path::new("train.csv"), content, ',', &["chrom".to_string()]).unwrap()
    }

    #[test]
    fn test_constant_strategies() {
        let t = table("chrom,a,b,c\nChr1,1,0,0\n");
        assert_eq!(PosWeightStrategy::Ones.compute(&t).unwrap(), vec![1.0; 3]);
        assert_eq!(PosWeightStrategy::Eights.compute(&t).unwrap(), vec![8.0; 3]);
    }

    #[test]
    fn test_sqrt_inv_freq() {
        // a: p = 0.2 -> sqrt(4) = 2, b: p = 0.5 -> 1
        let t = table("chrom,a,b\nChr1,1,1\nChr1,0,1\nChr1,0,0\nChr1,0,0\nChr1,0,1\n");
        let w = PosWeightStrategy::SqrtInvFreq.compute(&t).unwrap();
        assert!((w[0] - 2.0).abs() < 1e-12);
        assert!((w[1] - (0.4_f64 / 0.6).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_sqrt_inv_freq_rejects_single_class() {
        let t = table("chrom,never,always\nChr1,0,1\nChr2,0,1\n");
        let err = PosWeightStrategy::SqrtInvFreq.compute(&t).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("never"));
        assert!(msg.contains("always"));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&PosWeightStrategy::SqrtInvFreq).unwrap(),
            "\"sqrt_inv_freq\""
        );
    }
}
