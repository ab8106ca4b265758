//! Tabular export of a study's trials.

use crate::error::MlError;
use crate::persistence::atomic_write;
use crate::study::trial::FrozenTrial;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Trials flattened into rows of strings, one column per attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialsDataFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TrialsDataFrame {
    pub fn from_trials(trials: &[FrozenTrial]) -> Self {
        let param_names: BTreeSet<&String> = trials.iter().flat_map(|t| t.params.keys()).collect();
        let attr_keys: BTreeSet<&String> =
            trials.iter().flat_map(|t| t.user_attrs.keys()).collect();

        let mut columns: Vec<String> = [
            "",
            "number",
            "value",
            "datetime_start",
            "datetime_complete",
            "duration",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        columns.extend(param_names.iter().map(|name| format!("params_{name}")));
        columns.extend(attr_keys.iter().map(|key| format!("user_attrs_{key}")));
        columns.push("state".to_string());

        let rows = trials
            .iter()
            .enumerate()
            .map(|(index, trial)| {
                let mut row = vec![
                    index.to_string(),
                    trial.number.to_string(),
                    trial.value.map(|v| v.to_string()).unwrap_or_default(),
                    format_datetime(&trial.datetime_start),
                    trial
                        .datetime_complete
                        .as_ref()
                        .map(format_datetime)
                        .unwrap_or_default(),
                    trial.duration().map(format_duration).unwrap_or_default(),
                ];
                row.extend(
                    param_names
                        .iter()
                        .map(|name| trial.params.get(*name).map(cell).unwrap_or_default()),
                );
                row.extend(
                    attr_keys
                        .iter()
                        .map(|key| trial.user_attrs.get(*key).map(cell).unwrap_or_default()),
                );
                row.push(trial.state.to_string());
                row
            })
            .collect();

        Self { columns, rows }
    }

    pub fn to_tsv(&self) -> String {
        let mut out = self.columns.join("\t");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }

    pub fn export_tsv(&self, path: &Path) -> Result<(), MlError> {
        atomic_write(path, self.to_tsv().as_bytes())
    }
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.replace(['\t', '\n'], " "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// `0 days 01:02:03.000004`
fn format_duration(duration: chrono::Duration) -> String {
    let micros = duration.num_microseconds().unwrap_or(i64::MAX).max(0);
    let total_secs = micros / 1_000_000;
    format!(
        "{} days {:02}:{:02}:{:02}.{:06}",
        total_secs / 86_400,
        (total_secs % 86_400) / 3_600,
        (total_secs % 3_600) / 60,
        total_secs % 60,
        micros % 1_000_000
    )
}
