//! Snapshot creation, lookup and restore.

use std::{collections::BTreeMap, sync::Arc};

use host_agent_core::{
    EventHub,
    clock::MonotonicMillis,
    ids::sanitize_component,
    traits::{Snapshot, SnapshotId, SnapshotStorage, SnapshotSummary, StateCapture, StorageError},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Attempts at finding a free id when a stored snapshot already uses one.
const ID_ATTEMPTS: usize = 3;

/// Snapshot creation or lookup error.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Capture {capture} failed: {reason}")]
    CaptureFailed { capture: String, reason: String },
    #[error("Failed to persist snapshot: {0}")]
    PersistFailed(String),
    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),
}

/// Restore error.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),
    #[error("Restore incomplete: {} restored, {} failed", .restored.len(), .failed.len())]
    PartialRestore {
        restored: Vec<String>,
        failed: Vec<(String, String)>,
    },
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result of a fully successful restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub snapshot_id: SnapshotId,
    pub restored: Vec<String>,
}

/// Creates snapshots from the registered captures and restores them.
pub struct SnapshotStore {
    storage: Arc<dyn SnapshotStorage>,
    captures: Vec<Arc<dyn StateCapture>>,
    clock: MonotonicMillis,
    events: Option<Arc<EventHub>>,
}

impl SnapshotStore {
    /// Create a store with no captures.
    #[must_use]
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            storage,
            captures: Vec::new(),
            clock: MonotonicMillis::new(),
            events: None,
        }
    }

    /// Register a capture. A later capture with the same name replaces the
    /// earlier one.
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn StateCapture>) -> Self {
        self.captures.retain(|c| c.name() != capture.name());
        self.captures.push(capture);
        self
    }

    /// Publish snapshot events to `hub`.
    #[must_use]
    pub fn with_events(mut self, hub: Arc<EventHub>) -> Self {
        self.events = Some(hub);
        self
    }

    /// Names of the registered captures, in capture order.
    #[must_use]
    pub fn capture_names(&self) -> Vec<String> {
        self.captures.iter().map(|c| c.name().to_string()).collect()
    }

    /// Capture every registered facet and persist the result.
    ///
    /// # Errors
    /// Returns `CaptureFailed` if any capture fails and `PersistFailed` if
    /// the snapshot cannot be stored. Nothing is left behind in either case.
    pub async fn create(&self, label: &str) -> Result<SnapshotId, SnapshotError> {
        let mut captures = BTreeMap::new();
        for capture in &self.captures {
            let value = capture
                .capture()
                .await
                .map_err(|e| SnapshotError::CaptureFailed {
                    capture: capture.name().to_string(),
                    reason: e.to_string(),
                })?;
            captures.insert(capture.name().to_string(), value);
        }

        let prefix = sanitize_component(label);
        let mut last_error = None;
        for _ in 0..ID_ATTEMPTS {
            let created_at = self.clock.next();
            let snapshot = Snapshot {
                id: format!("{prefix}_{created_at}"),
                label: label.to_string(),
                created_at,
                captures: captures.clone(),
            };
            match self.storage.put(&snapshot).await {
                Ok(()) => {
                    tracing::info!(snapshot_id = %snapshot.id, label, "snapshot created");
                    self.emit(
                        "snapshot.created",
                        json!({
                            "snapshotId": snapshot.id,
                            "label": label,
                            "captures": snapshot.captures.keys().collect::<Vec<_>>(),
                        }),
                    );
                    return Ok(snapshot.id);
                }
                Err(StorageError::AlreadyExists(id)) => {
                    tracing::debug!(snapshot_id = %id, "snapshot id taken, retrying");
                    last_error = Some(StorageError::AlreadyExists(id));
                }
                Err(e) => {
                    // a failed write must not leave a readable record
                    if let Err(cleanup) = self.storage.remove(&snapshot.id).await {
                        tracing::warn!(snapshot_id = %snapshot.id, error = %cleanup, "cleanup after failed write");
                    }
                    return Err(SnapshotError::PersistFailed(e.to_string()));
                }
            }
        }
        Err(SnapshotError::PersistFailed(
            last_error.map_or_else(|| "no id available".to_string(), |e| e.to_string()),
        ))
    }

    /// Fetch a snapshot.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids and `PersistFailed` when storage
    /// cannot be read.
    pub async fn get(&self, id: &str) -> Result<Snapshot, SnapshotError> {
        self.storage
            .get(id)
            .await
            .map_err(|e| SnapshotError::PersistFailed(e.to_string()))?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))
    }

    /// Stored snapshots, newest first.
    ///
    /// # Errors
    /// Returns error if storage cannot be read.
    pub async fn list(&self) -> Result<Vec<SnapshotSummary>, SnapshotError> {
        self.storage
            .list()
            .await
            .map_err(|e| SnapshotError::PersistFailed(e.to_string()))
    }

    /// Re-apply every sub-capture of a snapshot.
    ///
    /// Sub-captures are applied independently; a failure does not stop the
    /// others and nothing is rolled back.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids and `PartialRestore` naming each
    /// sub-capture that could not be applied.
    pub async fn restore(&self, id: &str) -> Result<RestoreReport, RestoreError> {
        let snapshot = self
            .storage
            .get(id)
            .await
            .map_err(|e| RestoreError::Storage(e.to_string()))?
            .ok_or_else(|| RestoreError::NotFound(id.to_string()))?;

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for (name, value) in &snapshot.captures {
            let Some(capture) = self.captures.iter().find(|c| c.name() == name.as_str()) else {
                failed.push((name.clone(), "capture is not registered".to_string()));
                continue;
            };
            match capture.restore(value).await {
                Ok(()) => restored.push(name.clone()),
                Err(e) => {
                    tracing::warn!(snapshot_id = %snapshot.id, capture = %name, error = %e, "restore failed");
                    failed.push((name.clone(), e.to_string()));
                }
            }
        }

        if failed.is_empty() {
            tracing::info!(snapshot_id = %snapshot.id, "snapshot restored");
            self.emit(
                "snapshot.restored",
                json!({ "snapshotId": snapshot.id, "restored": restored }),
            );
            Ok(RestoreReport {
                snapshot_id: snapshot.id,
                restored,
            })
        } else {
            self.emit(
                "snapshot.restore_failed",
                json!({
                    "snapshotId": snapshot.id,
                    "restored": restored,
                    "failed": failed.iter().map(|(c, r)| json!({"capture": c, "reason": r})).collect::<Vec<_>>(),
                }),
            );
            Err(RestoreError::PartialRestore { restored, failed })
        }
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(hub) = &self.events {
            hub.emit(event_type, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use host_agent_core::{Topic, traits::CaptureError};
    use serde_json::Value;
    use uuid::Uuid;

    use super::*;
    use crate::{
        captures::{HostProperties, PropertiesCapture},
        storage::{FsSnapshotStorage, MemorySnapshotStorage},
    };

    /// Capture whose behavior tests can flip.
    struct Switch {
        name: &'static str,
        fail_capture: AtomicBool,
        fail_restore: AtomicBool,
    }

    impl Switch {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_capture: AtomicBool::new(false),
                fail_restore: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl StateCapture for Switch {
        fn name(&self) -> &str {
            self.name
        }

        async fn capture(&self) -> Result<Value, CaptureError> {
            if self.fail_capture.load(Ordering::SeqCst) {
                return Err(CaptureError::Failed("sensor offline".into()));
            }
            Ok(json!([self.name]))
        }

        async fn restore(&self, _: &Value) -> Result<(), CaptureError> {
            if self.fail_restore.load(Ordering::SeqCst) {
                return Err(CaptureError::Failed("read-only mount".into()));
            }
            Ok(())
        }
    }

    fn properties_store() -> (SnapshotStore, Arc<HostProperties>) {
        let properties = Arc::new(HostProperties::detect("test"));
        let store = SnapshotStore::new(Arc::new(MemorySnapshotStorage::new()))
            .with_capture(Arc::new(PropertiesCapture::new(Arc::clone(&properties))));
        (store, properties)
    }

    #[tokio::test]
    async fn test_create_then_get_returns_captures() {
        let (store, properties) = properties_store();
        let id = store.create("manual").await.unwrap();
        assert!(id.starts_with("manual_"));

        let snapshot = store.get(&id).await.unwrap();
        assert_eq!(snapshot.label, "manual");
        assert_eq!(
            snapshot.captures["properties"],
            Value::Object(properties.to_map().into_iter().collect())
        );
    }

    #[tokio::test]
    async fn test_same_label_same_millisecond_ids_are_unique() {
        let (store, _) = properties_store();
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(store.create("burst").await.unwrap());
        }
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
        assert_eq!(store.list().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_label_is_sanitized_in_id_only() {
        let (store, _) = properties_store();
        let id = store.create("before mutation com/example").await.unwrap();
        assert!(id.starts_with("before_mutation_com_example_"));
        assert_eq!(store.get(&id).await.unwrap().label, "before mutation com/example");
    }

    #[tokio::test]
    async fn test_capture_failure_persists_nothing() {
        let (store, _) = properties_store();
        let flaky = Switch::new("services");
        flaky.fail_capture.store(true, Ordering::SeqCst);
        let store = store.with_capture(flaky);

        let err = store.create("manual").await.unwrap_err();
        assert!(matches!(err, SnapshotError::CaptureFailed { capture, .. } if capture == "services"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_restore_create_is_stable() {
        let (store, properties) = properties_store();
        let first = store.create("baseline").await.unwrap();

        properties.set("feature.flag", json!("on"));
        let report = store.restore(&first).await.unwrap();
        assert_eq!(report.restored, vec!["properties"]);

        let second = store.create("after").await.unwrap();
        assert_eq!(
            store.get(&first).await.unwrap().captures,
            store.get(&second).await.unwrap().captures
        );
    }

    #[tokio::test]
    async fn test_partial_restore_names_failures() {
        let (store, _) = properties_store();
        let services = Switch::new("services");
        let store = store.with_capture(Arc::clone(&services) as Arc<dyn StateCapture>);
        let id = store.create("manual").await.unwrap();

        services.fail_restore.store(true, Ordering::SeqCst);
        match store.restore(&id).await {
            Err(RestoreError::PartialRestore { restored, failed }) => {
                assert_eq!(restored, vec!["properties"]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "services");
                assert!(failed[0].1.contains("read-only mount"));
            }
            other => panic!("unexpected restore result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_unknown_id() {
        let (store, _) = properties_store();
        assert!(matches!(
            store.restore("nope_1").await,
            Err(RestoreError::NotFound(id)) if id == "nope_1"
        ));
        assert!(matches!(
            store.get("nope_1").await,
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_emits_created_and_restored() {
        let hub = Arc::new(EventHub::new());
        let conn = Uuid::new_v4();
        let mut rx = hub.register(conn);
        hub.subscribe(conn, Topic::Component("snapshot".into())).unwrap();

        let (store, _) = properties_store();
        let store = store.with_events(Arc::clone(&hub));
        let id = store.create("manual").await.unwrap();
        store.restore(&id).await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.event_type, "snapshot.created");
        assert_eq!(created.payload["snapshotId"], id.as_str());
        assert_eq!(rx.recv().await.unwrap().event_type, "snapshot.restored");
    }

    #[tokio::test]
    async fn test_filesystem_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsSnapshotStorage::open(dir.path()).unwrap());
        let store = SnapshotStore::new(storage).with_capture(Switch::new("services"));

        let id = store.create("service_start").await.unwrap();
        assert!(dir.path().join(format!("{id}.json")).is_file());
        assert_eq!(store.get(&id).await.unwrap().captures["services"], json!(["services"]));
    }

    #[tokio::test]
    async fn test_dot_prefixed_label_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsSnapshotStorage::open(dir.path()).unwrap());
        let store = SnapshotStore::new(storage).with_capture(Switch::new("services"));

        let id = store.create(".hidden").await.unwrap();
        assert!(id.starts_with("_.hidden_"));
        assert!(dir.path().join(format!("{id}.json")).is_file());
        assert_eq!(store.get(&id).await.unwrap().label, ".hidden");
    }
}
