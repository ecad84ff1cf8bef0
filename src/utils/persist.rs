//! JSON file persistence shared by the health registry and the result cache.

use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors writing or reading persisted state
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        PersistError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialize `data` and write it to `path`, replacing any previous file only
/// once the new content is fully on disk.
///
/// Each call stages its bytes in a uniquely named file next to `path`, so
/// concurrent writers to the same path never share a staging file; the last
/// rename wins.
pub async fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), PersistError> {
    let content = serde_json::to_vec_pretty(data).map_err(|e| PersistError::json(path, e))?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| PersistError::io(&parent, e))?;

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_staged(&parent, &target, &content))
        .await
        .map_err(|e| PersistError::io(path, std::io::Error::other(e)))?
}

fn write_staged(parent: &Path, target: &Path, content: &[u8]) -> Result<(), PersistError> {
    let mut staged =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| PersistError::io(parent, e))?;
    staged
        .write_all(content)
        .and_then(|()| staged.flush())
        .map_err(|e| PersistError::io(staged.path(), e))?;
    staged
        .persist(target)
        .map_err(|e| PersistError::io(target, e.error))?;
    Ok(())
}

/// Read and deserialize a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let content = std::fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| PersistError::json(path, e))
}

/// Remove a file, treating "already gone" as success
pub async fn remove_file(path: &Path) -> Result<(), PersistError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut data = BTreeMap::new();
        data.insert("a".to_string(), 1u32);
        write_json(&path, &data).await.unwrap();

        let back: BTreeMap<String, u32> = read_json(&path).unwrap();
        assert_eq!(back, data);

        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");

        let writes = (0..8u32).map(|i| {
            let path = path.clone();
            async move {
                let mut data = BTreeMap::new();
                data.insert("writer".to_string(), i);
                write_json(&path, &data).await
            }
        });
        for outcome in futures_util::future::join_all(writes).await {
            outcome.unwrap();
        }

        let back: BTreeMap<String, u32> = read_json(&path).unwrap();
        assert!(back["writer"] < 8);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_read_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = read_json::<BTreeMap<String, u32>>(&path).unwrap_err();
        assert!(matches!(err, PersistError::Json { .. }));
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_file(&dir.path().join("missing.json")).await.unwrap();
    }
}
