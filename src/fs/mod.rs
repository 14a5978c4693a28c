//! Publishing helpers for shared coordination files.
//!
//! Writers publish with write-to-temp-then-rename so a concurrent reader sees either
//! the old file or the new one, never a torn mix. Readers still retry a failed parse
//! a few times to ride out writers that do not follow the protocol.

use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Marker embedded in temp file names, used by repair to find leftovers
pub const TEMP_MARKER: &str = ".tmp.";

/// Temp path next to `path`: `task-queue.json` -> `task-queue.json.tmp.<uuid>`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("{TEMP_MARKER}{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().contains(TEMP_MARKER))
        .unwrap_or(false)
}

/// Write `contents` to `path` atomically: temp file, fsync, rename
pub async fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let temp_path = temp_path_for(path);

    let written = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        restrict_permissions(&temp_path).await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

/// Outcome of a retrying JSON read
#[derive(Debug)]
pub enum JsonRead<T> {
    Missing,
    Parsed(T),
    Corrupt(String),
}

/// Read and parse JSON, retrying parse failures `attempts` times with a short pause
pub async fn read_json_with_retry<T: DeserializeOwned>(
    path: &Path,
    attempts: u32,
) -> std::io::Result<JsonRead<T>> {
    let mut last_error = String::new();
    for attempt in 0..attempts.max(1) {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(JsonRead::Missing),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => return Ok(JsonRead::Parsed(value)),
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt + 1))).await;
                }
            }
        }
    }
    Ok(JsonRead::Corrupt(last_error))
}

#[cfg(unix)]
pub async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
pub async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task-queue.json");

        for value in [1, 2] {
            let body = serde_json::to_vec(&Doc { value }).unwrap();
            atomic_write(&path, &body).await.unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["task-queue.json".to_string()]);

        match read_json_with_retry::<Doc>(&path, 1).await.unwrap() {
            JsonRead::Parsed(doc) => assert_eq!(doc, Doc { value: 2 }),
            other => panic!("unexpected read: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_and_missing_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent-registry.json");

        assert!(matches!(
            read_json_with_retry::<Doc>(&path, 2).await.unwrap(),
            JsonRead::Missing
        ));

        std::fs::write(&path, b"{\"value\": 1").unwrap();
        assert!(matches!(
            read_json_with_retry::<Doc>(&path, 2).await.unwrap(),
            JsonRead::Corrupt(_)
        ));
    }

    #[test]
    fn test_temp_path_detection() {
        let temp = temp_path_for(Path::new("/x/task-queue.json"));
        assert!(is_temp_file(&temp));
        assert!(!is_temp_file(Path::new("/x/task-queue.json")));
    }
}
