//! Snapshot storage implementations.

pub mod fs;
#[cfg(feature = "memory")]
pub mod memory;

pub use fs::FsSnapshotStorage;
#[cfg(feature = "memory")]
pub use memory::MemorySnapshotStorage;
