//! SQLite-backed study storage.

use crate::error::MlError;
use crate::study::StudyDirection;
use crate::study::sampler::ParamDistribution;
use crate::study::trial::{FrozenTrial, TrialState};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS studies (
    study_id INTEGER PRIMARY KEY AUTOINCREMENT,
    study_name TEXT NOT NULL UNIQUE,
    direction TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trials (
    trial_id INTEGER PRIMARY KEY AUTOINCREMENT,
    study_id INTEGER NOT NULL REFERENCES studies(study_id),
    number INTEGER NOT NULL,
    state TEXT NOT NULL,
    value REAL,
    datetime_start TEXT NOT NULL,
    datetime_complete TEXT,
    UNIQUE(study_id, number)
);
CREATE TABLE IF NOT EXISTS trial_params (
    trial_id INTEGER NOT NULL REFERENCES trials(trial_id),
    param_name TEXT NOT NULL,
    param_value TEXT NOT NULL,
    distribution TEXT NOT NULL,
    PRIMARY KEY (trial_id, param_name)
);
CREATE TABLE IF NOT EXISTS trial_user_attrs (
    trial_id INTEGER NOT NULL REFERENCES trials(trial_id),
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (trial_id, key)
);
";

/// Parsed `sqlite:///…` storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUrl {
    Memory,
    File(PathBuf),
}

impl StorageUrl {
    /// Parse a storage URL. Relative paths are resolved against `base`.
    ///
    /// `sqlite:///study.db` is relative, `sqlite:////tmp/study.db` is
    /// absolute and `sqlite:///:memory:` stays in memory.
    pub fn parse(url: &str, base: &Path) -> Result<Self, MlError> {
        let rest = url.strip_prefix("sqlite:///").ok_or_else(|| {
            MlError::invalid_input(format!(
                "unsupported storage '{url}', expected sqlite:///<path>"
            ))
        })?;
        match rest {
            "" => Err(MlError::invalid_input("storage URL has no database path")),
            ":memory:" => Ok(StorageUrl::Memory),
            path if Path::new(path).is_absolute() => Ok(StorageUrl::File(PathBuf::from(path))),
            path => Ok(StorageUrl::File(base.join(path))),
        }
    }
}

/// Study and trial records in a SQLite database.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(url: &StorageUrl) -> Result<Self, MlError> {
        let conn = match url {
            StorageUrl::Memory => Connection::open_in_memory()?,
            StorageUrl::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
        };
        conn.execute_batch(SCHEMA)?;
        debug!(storage = ?url, "Opened study storage");
        Ok(Self { conn })
    }

    /// Open a database that must already exist on disk.
    pub fn open_existing(url: &StorageUrl) -> Result<Self, MlError> {
        if let StorageUrl::File(path) = url {
            if !path.is_file() {
                return Err(MlError::not_found(format!(
                    "study storage {}",
                    path.display()
                )));
            }
        }
        Self::open(url)
    }

    /// Look up an existing study; returns its id and direction.
    pub fn find_study(&self, name: &str) -> Result<(i64, StudyDirection), MlError> {
        let found: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT study_id, direction FROM studies WHERE study_name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (study_id, direction) =
            found.ok_or_else(|| MlError::not_found(format!("study '{name}'")))?;
        Ok((study_id, direction.parse()?))
    }

    /// Create a study, or return the existing one when `load_if_exists`.
    pub fn create_study(
        &self,
        name: &str,
        direction: StudyDirection,
        load_if_exists: bool,
    ) -> Result<i64, MlError> {
        let existing = match self.find_study(name) {
            Ok(found) => Some(found),
            Err(MlError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some((study_id, stored)) = existing {
            if !load_if_exists {
                return Err(MlError::AlreadyExists(format!("study '{name}'")));
            }
            if stored != direction {
                return Err(MlError::study(format!(
                    "study '{name}' was created to {stored}, not {direction}"
                )));
            }
            return Ok(study_id);
        }

        self.conn.execute(
            "INSERT INTO studies (study_name, direction, created_at) VALUES (?1, ?2, ?3)",
            params![name, direction.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Start a new trial; returns `(trial_id, number)`.
    pub fn create_trial(&mut self, study_id: i64) -> Result<(i64, usize), MlError> {
        let tx = self.conn.transaction()?;
        let number: i64 = tx.query_row(
            "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
            params![study_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO trials (study_id, number, state, datetime_start) VALUES (?1, ?2, ?3, ?4)",
            params![
                study_id,
                number,
                TrialState::Running.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        let trial_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((trial_id, number as usize))
    }

    pub fn set_trial_param(
        &self,
        trial_id: i64,
        name: &str,
        value: &serde_json::Value,
        distribution: &ParamDistribution,
    ) -> Result<(), MlError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO trial_params (trial_id, param_name, param_value, distribution)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                trial_id,
                name,
                serde_json::to_string(value)?,
                serde_json::to_string(distribution)?
            ],
        )?;
        Ok(())
    }

    pub fn set_user_attr(
        &self,
        trial_id: i64,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), MlError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO trial_user_attrs (trial_id, key, value_json) VALUES (?1, ?2, ?3)",
            params![trial_id, key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    pub fn finish_trial(
        &self,
        trial_id: i64,
        state: TrialState,
        value: Option<f64>,
    ) -> Result<(), MlError> {
        let updated = self.conn.execute(
            "UPDATE trials SET state = ?1, value = ?2, datetime_complete = ?3 WHERE trial_id = ?4",
            params![state.as_str(), value, Utc::now().to_rfc3339(), trial_id],
        )?;
        if updated == 0 {
            return Err(MlError::not_found(format!("trial {trial_id}")));
        }
        Ok(())
    }

    /// All trials of a study ordered by number.
    pub fn get_all_trials(&self, study_id: i64) -> Result<Vec<FrozenTrial>, MlError> {
        let mut stmt = self.conn.prepare(
            "SELECT trial_id, number, state, value, datetime_start, datetime_complete
             FROM trials WHERE study_id = ?1 ORDER BY number",
        )?;
        let rows = stmt
            .query_map(params![study_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut trials = Vec::with_capacity(rows.len());
        for (trial_id, number, state, value, start, complete) in rows {
            trials.push(FrozenTrial {
                trial_id,
                number: number as usize,
                state: state.parse()?,
                value,
                params: self.load_json_map(
                    "SELECT param_name, param_value FROM trial_params WHERE trial_id = ?1",
                    trial_id,
                )?,
                user_attrs: self.load_json_map(
                    "SELECT key, value_json FROM trial_user_attrs WHERE trial_id = ?1",
                    trial_id,
                )?,
                datetime_start: parse_timestamp(&start)?,
                datetime_complete: complete.as_deref().map(parse_timestamp).transpose()?,
            });
        }
        Ok(trials)
    }

    fn load_json_map(
        &self,
        sql: &str,
        trial_id: i64,
    ) -> Result<BTreeMap<String, serde_json::Value>, MlError> {
        let mut stmt = self.conn.prepare(sql)?;
        let pairs = stmt
            .query_map(params![trial_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        pairs
            .into_iter()
            .map(|(key, json)| -> Result<_, MlError> { Ok((key, serde_json::from_str(&json)?)) })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MlError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MlError::study(format!("invalid timestamp '{raw}': {e}")))
}
