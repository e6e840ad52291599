//! In-memory snapshot storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use host_agent_core::traits::{Snapshot, SnapshotStorage, SnapshotSummary, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and ephemeral agents.
/// Data is lost on restart.
pub struct MemorySnapshotStorage {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySnapshotStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn put(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if snapshots.contains_key(&snapshot.id) {
            return Err(StorageError::AlreadyExists(snapshot.id.clone()));
        }
        snapshots.insert(snapshot.id.clone(), snapshot.clone());

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Snapshot>, StorageError> {
        Ok(self
            .snapshots
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>, StorageError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<SnapshotSummary> =
            snapshots.values().map(SnapshotSummary::from).collect();

        // Newest first
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        Ok(result)
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self
            .snapshots
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(id)
            .is_some())
    }
}
