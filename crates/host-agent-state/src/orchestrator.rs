//! Snapshot-then-mutate transactions, serialized per target.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use host_agent_core::{
    EventHub,
    traits::{AppCatalog, CatalogError, MutationError, MutationRequest, SnapshotId},
};
use host_agent_executor::MutationExecutors;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::store::SnapshotStore;

/// Failed transaction, with the pre-mutation snapshot when one was taken.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TransactionFailure<E: std::error::Error> {
    pub error: E,
    pub snapshot_id: Option<SnapshotId>,
}

/// Failed mutation.
pub type MutationFailure = TransactionFailure<MutationError>;

/// App modification error.
#[derive(Debug, Error)]
pub enum AppModifyError {
    #[error("Pre-modification snapshot failed: {0}")]
    PreconditionFailed(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Successful mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub target: String,
    pub method: String,
    pub snapshot_id: SnapshotId,
}

/// Successful app modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppModification {
    pub package: String,
    pub message: String,
    pub snapshot_id: SnapshotId,
}

/// Per-key async locks whose entries live only while in use.
#[derive(Default)]
struct TargetLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct TargetGuard<'a> {
    locks: &'a TargetLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl TargetLocks {
    async fn acquire(&self, key: &str) -> TargetGuard<'_> {
        // created before the wait so a cancelled waiter still cleans up
        let mut target = TargetGuard {
            locks: self,
            key: key.to_string(),
            guard: None,
        };
        let lock = Arc::clone(
            self.map()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        target.guard = Some(lock.lock_owned().await);
        target
    }

    fn len(&self) -> usize {
        self.map().len()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        // only the map's own reference left: nobody holds or awaits it
        if map.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(&self.key);
        }
    }
}

/// Runs mutations and app modifications as snapshot-first transactions.
///
/// Transactions on the same target never overlap; different targets run
/// independently.
pub struct MutationOrchestrator {
    snapshots: Arc<SnapshotStore>,
    executors: MutationExecutors,
    catalog: Arc<dyn AppCatalog>,
    locks: TargetLocks,
    events: Option<Arc<EventHub>>,
}

impl MutationOrchestrator {
    #[must_use]
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        executors: MutationExecutors,
        catalog: Arc<dyn AppCatalog>,
    ) -> Self {
        Self {
            snapshots,
            executors,
            catalog,
            locks: TargetLocks::default(),
            events: None,
        }
    }

    /// Publish transaction events to `hub`.
    #[must_use]
    pub fn with_events(mut self, hub: Arc<EventHub>) -> Self {
        self.events = Some(hub);
        self
    }

    /// Language tags with a registered executor.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        self.executors.languages()
    }

    /// Number of targets currently locked or awaited.
    #[must_use]
    pub fn active_targets(&self) -> usize {
        self.locks.len()
    }

    /// Snapshot, then apply a mutation.
    ///
    /// No executor runs unless the snapshot was stored. Nothing is rolled
    /// back on failure; the snapshot id is returned for a caller-driven
    /// restore.
    ///
    /// # Errors
    /// Returns `PreconditionFailed` when the snapshot cannot be taken,
    /// otherwise the executor's error alongside the snapshot id.
    pub async fn apply(
        &self,
        request: &MutationRequest,
    ) -> Result<MutationOutcome, MutationFailure> {
        let _guard = self.locks.acquire(&request.target).await;

        let snapshot_id = self
            .snapshots
            .create(&format!("before_mutation_{}", request.target))
            .await
            .map_err(|e| {
                tracing::warn!(target_name = %request.target, error = %e, "mutation aborted, no snapshot");
                self.emit(
                    "mutation.failed",
                    json!({
                        "target": request.target,
                        "method": request.method,
                        "error": e.to_string(),
                    }),
                );
                TransactionFailure {
                    error: MutationError::PreconditionFailed(e.to_string()),
                    snapshot_id: None,
                }
            })?;

        let result = match self.executors.get(&request.language) {
            Ok(executor) => executor.apply(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    target_name = %request.target,
                    method = %request.method,
                    snapshot_id = %snapshot_id,
                    "mutation applied"
                );
                self.emit(
                    "mutation.applied",
                    json!({
                        "target": request.target,
                        "method": request.method,
                        "language": request.language,
                        "snapshotId": snapshot_id,
                    }),
                );
                Ok(MutationOutcome {
                    target: request.target.clone(),
                    method: request.method.clone(),
                    snapshot_id,
                })
            }
            Err(error) => {
                tracing::warn!(
                    target_name = %request.target,
                    method = %request.method,
                    snapshot_id = %snapshot_id,
                    %error,
                    "mutation failed"
                );
                self.emit(
                    "mutation.failed",
                    json!({
                        "target": request.target,
                        "method": request.method,
                        "snapshotId": snapshot_id,
                        "error": error.to_string(),
                    }),
                );
                Err(TransactionFailure {
                    error,
                    snapshot_id: Some(snapshot_id),
                })
            }
        }
    }

    /// Snapshot, then modify an application through the catalog.
    ///
    /// # Errors
    /// Returns `PreconditionFailed` when the snapshot cannot be taken,
    /// otherwise the catalog's error alongside the snapshot id.
    pub async fn modify_app(
        &self,
        package: &str,
        modification: &str,
    ) -> Result<AppModification, TransactionFailure<AppModifyError>> {
        let _guard = self.locks.acquire(&format!("app:{package}")).await;

        let snapshot_id = self
            .snapshots
            .create(&format!("before_app_modify_{package}"))
            .await
            .map_err(|e| TransactionFailure {
                error: AppModifyError::PreconditionFailed(e.to_string()),
                snapshot_id: None,
            })?;

        match self.catalog.modify(package, modification).await {
            Ok(message) => {
                tracing::info!(package, snapshot_id = %snapshot_id, "app modified");
                self.emit(
                    "app.modified",
                    json!({ "package": package, "snapshotId": snapshot_id }),
                );
                Ok(AppModification {
                    package: package.to_string(),
                    message,
                    snapshot_id,
                })
            }
            Err(e) => {
                tracing::warn!(package, snapshot_id = %snapshot_id, error = %e, "app modification failed");
                self.emit(
                    "app.modify_failed",
                    json!({ "package": package, "snapshotId": snapshot_id, "error": e.to_string() }),
                );
                Err(TransactionFailure {
                    error: e.into(),
                    snapshot_id: Some(snapshot_id),
                })
            }
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
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use host_agent_core::{
        MutationExecutor,
        clock::now_millis,
        traits::{AppInfo, CaptureError, MutationTechnique, StateCapture},
    };
    use serde_json::Value;

    use super::*;
    use crate::storage::MemorySnapshotStorage;

    /// Executor recording the wall-clock span of every call.
    #[derive(Default)]
    struct Recording {
        delay: Duration,
        /// Held after the span is recorded, before returning.
        tail: Duration,
        fail: Option<MutationError>,
        spans: Mutex<Vec<(String, i64, i64)>>,
    }

    #[async_trait]
    impl MutationExecutor for Recording {
        fn technique(&self) -> MutationTechnique {
            MutationTechnique::CompileAndLoad
        }

        async fn apply(&self, request: &MutationRequest) -> Result<(), MutationError> {
            let start = now_millis();
            tokio::time::sleep(self.delay).await;
            self.spans
                .lock()
                .unwrap()
                .push((request.target.clone(), start, now_millis()));
            tokio::time::sleep(self.tail).await;
            self.fail.clone().map_or(Ok(()), Err)
        }
    }

    struct BrokenCapture;

    #[async_trait]
    impl StateCapture for BrokenCapture {
        fn name(&self) -> &str {
            "services"
        }

        async fn capture(&self) -> Result<Value, CaptureError> {
            Err(CaptureError::Failed("disk full".into()))
        }

        async fn restore(&self, _: &Value) -> Result<(), CaptureError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Catalog {
        modified: AtomicUsize,
    }

    #[async_trait]
    impl AppCatalog for Catalog {
        async fn list(&self) -> Result<Vec<AppInfo>, CatalogError> {
            Ok(Vec::new())
        }

        async fn modify(&self, package: &str, _: &str) -> Result<String, CatalogError> {
            self.modified.fetch_add(1, Ordering::SeqCst);
            if package == "missing" {
                return Err(CatalogError::CommandFailed("unknown package".into()));
            }
            Ok(format!("{package} updated"))
        }
    }

    fn request(target: &str) -> MutationRequest {
        MutationRequest {
            target: target.into(),
            method: "onCreate".into(),
            payload: "return;".into(),
            language: "native".into(),
        }
    }

    fn orchestrator(executor: Arc<Recording>) -> (Arc<MutationOrchestrator>, Arc<SnapshotStore>) {
        let snapshots = Arc::new(SnapshotStore::new(Arc::new(MemorySnapshotStorage::new())));
        let mut executors = MutationExecutors::new();
        executors.register("native", executor);
        let orchestrator = MutationOrchestrator::new(
            Arc::clone(&snapshots),
            executors,
            Arc::new(Catalog::default()),
        );
        (Arc::new(orchestrator), snapshots)
    }

    #[tokio::test]
    async fn test_apply_snapshots_first() {
        let executor = Arc::new(Recording::default());
        let (orchestrator, snapshots) = orchestrator(Arc::clone(&executor));

        let outcome = orchestrator.apply(&request("com.example.Main")).await.unwrap();
        assert!(outcome.snapshot_id.starts_with("before_mutation_com.example.Main_"));

        let snapshot = snapshots.get(&outcome.snapshot_id).await.unwrap();
        assert_eq!(snapshot.label, "before_mutation_com.example.Main");
        let (_, started, _) = executor.spans.lock().unwrap()[0].clone();
        assert!(snapshot.created_at <= started);
        assert_eq!(orchestrator.active_targets(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_skips_executor() {
        let executor = Arc::new(Recording::default());
        let snapshots = Arc::new(
            SnapshotStore::new(Arc::new(MemorySnapshotStorage::new()))
                .with_capture(Arc::new(BrokenCapture)),
        );
        let mut executors = MutationExecutors::new();
        executors.register("native", Arc::clone(&executor) as Arc<dyn MutationExecutor>);
        let orchestrator =
            MutationOrchestrator::new(snapshots, executors, Arc::new(Catalog::default()));

        let failure = orchestrator.apply(&request("com.example.Main")).await.unwrap_err();
        assert!(matches!(failure.error, MutationError::PreconditionFailed(_)));
        assert!(failure.snapshot_id.is_none());
        assert!(executor.spans.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executor_failure_carries_snapshot() {
        let executor = Arc::new(Recording {
            fail: Some(MutationError::CompileError("expected ';'".into())),
            ..Recording::default()
        });
        let (orchestrator, snapshots) = orchestrator(executor);

        let failure = orchestrator.apply(&request("com.example.Main")).await.unwrap_err();
        assert_eq!(failure.error, MutationError::CompileError("expected ';'".into()));
        let snapshot_id = failure.snapshot_id.unwrap();
        assert!(snapshots.get(&snapshot_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_language_is_unsupported() {
        let (orchestrator, _) = orchestrator(Arc::new(Recording::default()));
        let mut req = request("com.example.Main");
        req.language = "cobol".into();

        let failure = orchestrator.apply(&req).await.unwrap_err();
        assert_eq!(failure.error, MutationError::UnsupportedKind("cobol".into()));
        assert!(failure.snapshot_id.is_some());
    }

    #[tokio::test]
    async fn test_same_target_is_serialized() {
        let executor = Arc::new(Recording {
            delay: Duration::from_millis(100),
            tail: Duration::from_millis(5),
            ..Recording::default()
        });
        let (orchestrator, snapshots) = orchestrator(Arc::clone(&executor));

        let (first, second) = (request("com.example.Main"), request("com.example.Main"));
        let (a, b) = tokio::join!(orchestrator.apply(&first), orchestrator.apply(&second));
        let (a, b) = (a.unwrap(), b.unwrap());

        let spans = executor.spans.lock().unwrap().clone();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].2 <= spans[1].1, "executions overlapped: {spans:?}");

        let mut taken = vec![
            snapshots.get(&a.snapshot_id).await.unwrap(),
            snapshots.get(&b.snapshot_id).await.unwrap(),
        ];
        taken.sort_by_key(|s| s.created_at);
        assert!(taken[0].created_at <= spans[0].1);
        // the second snapshot is only taken once the first transaction ended
        assert!(
            taken[1].created_at > spans[0].2,
            "second snapshot at {} but first execution ended at {}",
            taken[1].created_at,
            spans[0].2
        );
        assert_eq!(orchestrator.active_targets(), 0);
    }

    #[tokio::test]
    async fn test_different_targets_run_concurrently() {
        let executor = Arc::new(Recording {
            delay: Duration::from_millis(200),
            ..Recording::default()
        });
        let (orchestrator, _) = orchestrator(executor);

        let (first, second) = (request("com.example.A"), request("com.example.B"));
        let started = Instant::now();
        let (a, b) = tokio::join!(orchestrator.apply(&first), orchestrator.apply(&second));
        a.unwrap();
        b.unwrap();
        assert!(started.elapsed() < Duration::from_millis(380));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_target() {
        let locks = Arc::new(TargetLocks::default());
        let held = locks.acquire("com.example.Main").await;

        let waiter = tokio::spawn({
            let locks = Arc::clone(&locks);
            async move {
                let _guard = locks.acquire("com.example.Main").await;
                std::future::pending::<()>().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.len(), 1);

        // holder leaves first, then the queued caller goes away
        drop(held);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_modify_app_transaction() {
        let (orchestrator, snapshots) = orchestrator(Arc::new(Recording::default()));

        let modified = orchestrator.modify_app("org.example.mail", "disable").await.unwrap();
        assert_eq!(modified.message, "org.example.mail updated");
        assert_eq!(
            snapshots.get(&modified.snapshot_id).await.unwrap().label,
            "before_app_modify_org.example.mail"
        );

        let failure = orchestrator.modify_app("missing", "disable").await.unwrap_err();
        assert!(matches!(failure.error, AppModifyError::Catalog(_)));
        assert!(failure.snapshot_id.is_some());
    }

    #[tokio::test]
    async fn test_emits_applied_and_failed() {
        let hub = Arc::new(EventHub::new());
        let conn = uuid::Uuid::new_v4();
        let mut rx = hub.register(conn);
        hub.subscribe(conn, host_agent_core::Topic::Component("mutation".into()))
            .unwrap();

        let snapshots = Arc::new(SnapshotStore::new(Arc::new(MemorySnapshotStorage::new())));
        let mut executors = MutationExecutors::new();
        executors.register("native", Arc::new(Recording::default()));
        let orchestrator =
            MutationOrchestrator::new(snapshots, executors, Arc::new(Catalog::default()))
                .with_events(hub);

        orchestrator.apply(&request("a")).await.unwrap();
        let mut bad = request("a");
        bad.language = "nope".into();
        orchestrator.apply(&bad).await.unwrap_err();

        assert_eq!(rx.recv().await.unwrap().event_type, "mutation.applied");
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.event_type, "mutation.failed");
        assert!(failed.payload["snapshotId"].is_string());
    }
}
