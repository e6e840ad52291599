//! Shared handler state.

use std::{sync::Arc, time::Duration};

use host_agent_core::{CredentialStore, EventHub, LogBuffer, traits::AppCatalog};
use host_agent_executor::CommandExecutor;
use host_agent_state::{MutationOrchestrator, SnapshotStore};

use crate::system_info::SystemProbe;

/// Everything the request handlers and the push channel need.
///
/// Built once at startup and cloned into every handler; each field is a
/// cheap handle.
#[derive(Clone)]
pub struct AgentState {
    pub credentials: Arc<CredentialStore>,
    pub executor: CommandExecutor,
    pub snapshots: Arc<SnapshotStore>,
    pub orchestrator: Arc<MutationOrchestrator>,
    pub catalog: Arc<dyn AppCatalog>,
    pub events: Arc<EventHub>,
    pub logs: Arc<LogBuffer>,
    pub system: Arc<SystemProbe>,
    /// Upper bound accepted for execute-command deadlines.
    pub max_timeout: Duration,
}
