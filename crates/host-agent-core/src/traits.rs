//! Core data model and the traits at the agent's seams.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Snapshot identifier (`<label>_<epoch millis>`).
pub type SnapshotId = String;

/// Persisted capture of host state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Unique identifier.
    pub id: SnapshotId,
    /// Human label the snapshot was created with.
    pub label: String,
    /// Creation timestamp (Unix epoch millis).
    pub created_at: i64,
    /// Named sub-captures, e.g. `properties`, `services`, `packages`.
    pub captures: BTreeMap<String, Value>,
}

/// Snapshot listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub label: String,
    pub created_at: i64,
    pub captures: Vec<String>,
}

impl From<&Snapshot> for SnapshotSummary {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            label: snapshot.label.clone(),
            created_at: snapshot.created_at,
            captures: snapshot.captures.keys().cloned().collect(),
        }
    }
}

/// Capture error.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{0}")]
    Failed(String),
    #[error("Captured value has unexpected shape: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One facet of host state that can be captured and re-applied.
#[async_trait]
pub trait StateCapture: Send + Sync {
    /// Name of the sub-capture inside a snapshot.
    fn name(&self) -> &str;

    /// Capture the current state of this facet.
    async fn capture(&self) -> Result<Value, CaptureError>;

    /// Re-apply a previously captured value to the live system.
    async fn restore(&self, captured: &Value) -> Result<(), CaptureError>;
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),
    #[error("Snapshot already exists: {0}")]
    AlreadyExists(SnapshotId),
    #[error("Invalid snapshot id: {0}")]
    InvalidId(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for snapshot storage backends.
///
/// `put` must be atomic: readers either see the complete snapshot or
/// nothing at all.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Persist a new snapshot.
    async fn put(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Get a snapshot by id.
    async fn get(&self, id: &str) -> Result<Option<Snapshot>, StorageError>;

    /// List stored snapshots, newest first.
    async fn list(&self) -> Result<Vec<SnapshotSummary>, StorageError>;

    /// Remove a snapshot. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, StorageError>;
}

/// Request to change the behavior of a live target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Target identifier, e.g. a class or module name.
    pub target: String,
    /// Operation within the target to replace.
    pub method: String,
    /// Replacement behavior payload.
    pub payload: String,
    /// Payload language/kind tag selecting the executor.
    pub language: String,
}

/// Injection technique implemented by a mutation executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationTechnique {
    /// Compile source, then load the artifact.
    CompileAndLoad,
    /// Apply raw bytes to the target.
    BytePatch,
}

/// Mutation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Pre-mutation snapshot failed: {0}")]
    PreconditionFailed(String),
    #[error("Compile error: {0}")]
    CompileError(String),
    #[error("Load error: {0}")]
    LoadError(String),
    #[error("Unsupported payload kind: {0}")]
    UnsupportedKind(String),
}

/// Capability applying a mutation with one injection technique.
///
/// Whether a failed application leaves the target untouched is the
/// executor's own concern.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    /// Technique this executor implements.
    fn technique(&self) -> MutationTechnique;

    /// Apply the mutation.
    async fn apply(&self, request: &MutationRequest) -> Result<(), MutationError>;
}

/// Installed application or package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Catalog error.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Not supported on this host: {0}")]
    Unsupported(String),
    #[error("Catalog command failed: {0}")]
    CommandFailed(String),
}

/// Enumerates and modifies installed applications.
#[async_trait]
pub trait AppCatalog: Send + Sync {
    /// List installed applications.
    async fn list(&self) -> Result<Vec<AppInfo>, CatalogError>;

    /// Apply a modification to an application. Returns a status message.
    async fn modify(&self, package: &str, modification: &str) -> Result<String, CatalogError>;
}
