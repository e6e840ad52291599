//! Filesystem snapshot storage: one JSON document per snapshot.

use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use host_agent_core::{
    ids::is_safe_id,
    traits::{Snapshot, SnapshotStorage, SnapshotSummary, StorageError},
};

const EXTENSION: &str = "json";

/// Stores each snapshot as `<dir>/<id>.json`.
///
/// Writes go to a temp file in the same directory, are synced, then linked
/// into place without overwriting, so readers see either the whole
/// document or nothing.
#[derive(Clone)]
pub struct FsSnapshotStorage {
    dir: Arc<PathBuf>,
}

impl FsSnapshotStorage {
    /// Open (creating if needed) a snapshot directory.
    ///
    /// On Unix the directory is restricted to the agent's user.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir: Arc::new(dir) })
    }

    /// Directory holding the snapshot files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{EXTENSION}"))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StorageError> + Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?
    }
}

fn write_atomic(dir: &Path, path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    temp_file.write_all(content)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, StorageError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SnapshotStorage for FsSnapshotStorage {
    async fn put(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        if !is_safe_id(&snapshot.id) {
            return Err(StorageError::InvalidId(snapshot.id.clone()));
        }
        let content = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path_for(&snapshot.id);
        let id = snapshot.id.clone();

        self.blocking(move |dir| match write_atomic(dir, &path, &content) {
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(id))
            }
            other => other,
        })
        .await?;

        tracing::debug!(snapshot_id = %snapshot.id, "snapshot written");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Snapshot>, StorageError> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        let path = self.path_for(id);
        self.blocking(move |_| read_snapshot(&path)).await
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>, StorageError> {
        let mut result = self
            .blocking(|dir| {
                let mut summaries = Vec::new();
                for entry in std::fs::read_dir(dir)? {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                        continue;
                    }
                    match read_snapshot(&path) {
                        Ok(Some(snapshot)) => summaries.push(SnapshotSummary::from(&snapshot)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                        }
                    }
                }
                Ok(summaries)
            })
            .await?;

        // Newest first
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(result)
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let path = self.path_for(id);
        self.blocking(move |_| match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn snapshot(id: &str, created_at: i64) -> Snapshot {
        Snapshot {
            id: id.into(),
            label: "before mutation".into(),
            created_at,
            captures: BTreeMap::from([
                ("properties".to_string(), json!({"os": "linux", "arch": "x86_64"})),
                ("services".to_string(), json!(["sshd", "cron"])),
            ]),
        }
    }

    #[tokio::test]
    async fn test_put_then_get_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsSnapshotStorage::open(dir.path().join("snapshots")).unwrap();
        let original = snapshot("manual_1700000000000", 1_700_000_000_000);
        storage.put(&original).await.unwrap();

        let reopened = FsSnapshotStorage::open(dir.path().join("snapshots")).unwrap();
        assert_eq!(reopened.get(&original.id).await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsSnapshotStorage::open(dir.path()).unwrap();
        storage.put(&snapshot("a_1", 1)).await.unwrap();
        storage.put(&snapshot("b_3", 3)).await.unwrap();
        storage.put(&snapshot("c_2", 2)).await.unwrap();
        std::fs::write(dir.path().join(".tmpXYZ"), b"{partial").unwrap();

        let list = storage.list().await.unwrap();
        let ids: Vec<_> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b_3", "c_2", "a_1"]);
        assert_eq!(list[0].captures, vec!["properties", "services"]);
    }

    #[tokio::test]
    async fn test_existing_id_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsSnapshotStorage::open(dir.path()).unwrap();
        storage.put(&snapshot("a_1", 1)).await.unwrap();

        let mut other = snapshot("a_1", 1);
        other.label = "other".into();
        assert!(matches!(
            storage.put(&other).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(
            storage.get("a_1").await.unwrap().unwrap().label,
            "before mutation"
        );
    }

    #[tokio::test]
    async fn test_path_like_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsSnapshotStorage::open(dir.path().join("snapshots")).unwrap();
        std::fs::write(dir.path().join("secret.json"), b"{}").unwrap();

        assert!(storage.get("../secret").await.unwrap().is_none());
        assert!(!storage.remove("../secret").await.unwrap());
        assert!(matches!(
            storage.put(&snapshot("../escape", 1)).await,
            Err(StorageError::InvalidId(_))
        ));
        assert!(dir.path().join("secret.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = FsSnapshotStorage::open(dir.path().join("snapshots")).unwrap();
        let mode = std::fs::metadata(storage.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
