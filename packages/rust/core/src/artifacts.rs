//! Artifact file helpers.
//!
//! Every artifact is written to a hidden temp file in the target directory
//! and renamed into place, so a reader never sees a half-written file.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use xaio_shared::{Result, XaioError};

/// Atomically write `content` to `path`, creating parent directories.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| XaioError::io(dir, e))?;

    let temp = temp_path(dir, path);
    std::fs::write(&temp, content).map_err(|e| XaioError::io(&temp, e))?;

    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(XaioError::io(path, e));
    }
    Ok(())
}

/// Pretty-print `data` as JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    write_atomic(path, json.as_bytes())
}

/// Read and parse a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = read_bytes(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        XaioError::Serialization(format!("invalid JSON in {}: {e}", path.display()))
    })
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| XaioError::io(path, e))
}

/// Read an upstream artifact, reporting absence as a missing precondition.
pub fn read_upstream(stage: &str, path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(XaioError::precondition(format!(
            "{stage} artifact not found at {}",
            path.display()
        )));
    }
    read_bytes(path)
}

fn temp_path(dir: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".into());
    dir.join(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_dir;

    #[test]
    fn write_atomic_creates_dirs_and_leaves_no_temp() {
        let tmp = temp_dir();
        let path = tmp.join("nested/out/x.json");
        write_atomic(&path, b"{}").expect("write");

        assert_eq!(std::fs::read(&path).expect("read"), b"{}");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn json_roundtrip_and_bad_json() {
        let tmp = temp_dir();
        let path = tmp.join("a.json");
        write_json(&path, &serde_json::json!({"k": [1, 2]})).expect("write");
        let v: serde_json::Value = read_json(&path).expect("read");
        assert_eq!(v["k"][1], 2);

        std::fs::write(&path, "{nope").expect("write");
        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_upstream_is_precondition() {
        let tmp = temp_dir();
        let err = read_upstream("meta", &tmp.join("missing.json")).unwrap_err();
        assert!(matches!(err, XaioError::Precondition { .. }));
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
