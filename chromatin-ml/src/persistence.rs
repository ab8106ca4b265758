//! File helpers shared by run logs, manifests and exports.

use crate::error::MlError;
use std::io::Write;
use std::path::Path;

/// Write `data` to a `.tmp` sibling and rename it over `path`, creating
/// parent directories as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), MlError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Pretty-print `data` as JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), MlError> {
    let json = serde_json::to_string_pretty(data)?;
    atomic_write(path, json.as_bytes())
}

/// Load JSON from `path`; `Ok(None)` when the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, MlError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Append one compact JSON line.
pub fn append_jsonl<T: serde::Serialize>(path: &Path, record: &T) -> Result<(), MlError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_json_nested_and_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("version_0").join("manifest.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<u32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_missing() {
        let loaded: Option<u32> = load_json(Path::new("/nonexistent/file.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_append_jsonl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.jsonl");
        append_jsonl(&path, &serde_json::json!({"step": 0})).unwrap();
        append_jsonl(&path, &serde_json::json!({"step": 1})).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"step\":0}\n{\"step\":1}\n");
    }
}
