//! Core abstractions for the host control-plane agent.
//!
//! This crate provides the fundamental building blocks:
//! - `CredentialStore` - Issued bearer tokens and authorization checks
//! - `EventHub` - Topic-filtered fan-out to push-channel connections
//! - `LogBuffer` - Bounded in-memory log history for remote inspection
//! - Capture, storage, mutation and catalog traits shared by all crates

pub mod clock;
pub mod credentials;
pub mod event;
pub mod event_hub;
pub mod ids;
pub mod log_buffer;
pub mod traits;

pub use credentials::{AccessToken, AuthError, CredentialStore};
pub use event::AgentEvent;
pub use event_hub::{ConnectionId, EventHub, Topic};
pub use log_buffer::{LogBuffer, LogBufferLayer};
pub use traits::{AppCatalog, MutationExecutor, SnapshotStorage, StateCapture};
