//! Snapshots, state captures and mutation transactions for the host agent.
//!
//! Provides:
//! - `SnapshotStore` - Capture, persist and restore host state
//! - Storage implementations (memory, filesystem)
//! - Built-in captures and the command-backed app catalog
//! - `MutationOrchestrator` - Snapshot-first transactions per target

pub mod captures;
pub mod catalog;
pub mod orchestrator;
pub mod storage;
pub mod store;

pub use captures::{CatalogCapture, CommandCapture, HostProperties, PropertiesCapture};
pub use catalog::CommandAppCatalog;
pub use orchestrator::{
    AppModification, AppModifyError, MutationFailure, MutationOrchestrator, MutationOutcome,
    TransactionFailure,
};
pub use store::{RestoreError, RestoreReport, SnapshotError, SnapshotStore};
