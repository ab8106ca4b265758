//! Delimited label tables for the chromatin datasets.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Label table of one split: metadata columns plus one 0/1 column per
/// chromatin feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelTable {
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    feature_indices: Vec<usize>,
}

impl LabelTable {
    /// Read a table, inferring the delimiter from the extension (`.tsv` -> tab,
    /// anything else -> comma).
    pub fn load(path: &Path, metadata_columns: &[String]) -> Result<Self, MlError> {
        let delimiter = match path.extension().and_then(|e| e.to_str()) {
            Some("tsv") | Some("txt") => '\t',
            _ => ',',
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| MlError::dataset(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse(path, &content, delimiter, metadata_columns)
    }

    /// Parse table content already in memory.
    pub fn parse(
        path: &Path,
        content: &str,
        delimiter: char,
        metadata_columns: &[String],
    ) -> Result<Self, MlError> {
        let mut lines = content.lines();

        let columns: Vec<String> = lines
            .next()
            .ok_or_else(|| MlError::dataset(format!("Empty label table {}", path.display())))?
            .split(delimiter)
            .map(|s| s.trim().trim_matches('"').to_string())
            .collect();

        let metadata: HashSet<&str> = metadata_columns.iter().map(String::as_str).collect();
        let feature_indices: Vec<usize> = columns
            .iter()
            .enumerate()
            // pandas writes an unnamed index column first
            .filter(|(_, name)| !name.is_empty() && !metadata.contains(name.as_str()))
            .map(|(i, _)| i)
            .collect();
        if feature_indices.is_empty() {
            return Err(MlError::dataset(format!(
                "No feature columns in {}",
                path.display()
            )));
        }

        let mut rows = Vec::new();
        for (line_no, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Vec<String> = line
                .split(delimiter)
                .map(|s| s.trim().trim_matches('"').to_string())
                .collect();
            if row.len() != columns.len() {
                return Err(MlError::dataset(format!(
                    "{}:{}: expected {} fields, found {}",
                    path.display(),
                    line_no + 2,
                    columns.len(),
                    row.len()
                )));
            }
            rows.push(row);
        }

        Ok(Self {
            path: path.to_path_buf(),
            columns,
            rows,
            feature_indices,
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Names of the label columns, in file order.
    pub fn feature_names(&self) -> Vec<String> {
        self.feature_indices
            .iter()
            .map(|&i| self.columns[i].clone())
            .collect()
    }

    /// Fraction of positive examples per feature.
    pub fn positive_frequency(&self) -> Result<Vec<f64>, MlError> {
        if self.rows.is_empty() {
            return Err(MlError::dataset(format!(
                "Label table {} has no rows",
                self.path.display()
            )));
        }
        let mut positives = vec![0.0_f64; self.feature_indices.len()];
        for (row_no, row) in self.rows.iter().enumerate() {
            for (slot, &col) in self.feature_indices.iter().enumerate() {
                positives[slot] += parse_label(&row[col]).ok_or_else(|| {
                    MlError::dataset(format!(
                        "{}: row {} column '{}' is not a 0/1 label: '{}'",
                        self.path.display(),
                        row_no + 1,
                        self.columns[col],
                        row[col]
                    ))
                })?;
            }
        }
        let n = self.rows.len() as f64;
        Ok(positives.into_iter().map(|count| count / n).collect())
    }
}

fn parse_label(cell: &str) -> Option<f64> {
    match cell {
        "1" | "1.0" | "true" | "True" => Some(1.0),
        "0" | "0.0" | "false" | "False" => Some(0.0),
        _ => None,
    }
}
