//! Wire protocol: request bodies, responses and push-channel messages.

use host_agent_core::{
    AgentEvent, Topic,
    traits::{AppInfo, Snapshot, SnapshotSummary},
};
use serde::{Deserialize, Serialize};

use crate::system_info::SystemInfo;

/// Default execute-command deadline in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Default number of log lines returned.
pub const DEFAULT_LOG_LINES: usize = 100;
/// Default log filter.
pub const DEFAULT_LOG_FILTER: &str = "AGENT";
/// Default payload language for mutations.
pub const DEFAULT_LANGUAGE: &str = "native";
/// Default snapshot label.
pub const DEFAULT_SNAPSHOT_NAME: &str = "manual";

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

const fn default_lines() -> usize {
    DEFAULT_LOG_LINES
}

fn default_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_snapshot_name() -> String {
    DEFAULT_SNAPSHOT_NAME.to_string()
}

// --- Requests ---

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    /// Deadline in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectRequest {
    pub target_class: String,
    pub method_name: String,
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    #[serde(default = "default_snapshot_name")]
    pub name: String,
}

/// Body naming one snapshot (rollback and get-snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotIdRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugLogsRequest {
    #[serde(default = "default_lines")]
    pub lines: usize,
    #[serde(default = "default_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyAppRequest {
    pub package_name: String,
    pub modification: String,
}

/// Body for operations that take no input.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Empty {}

// --- Responses ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// Captured stdout, partial when the command timed out.
    pub output: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectResponse {
    pub success: bool,
    pub target_class: String,
    pub method_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotResponse {
    pub snapshot_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sub-capture that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedCapture {
    pub capture: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub success: bool,
    pub snapshot_id: String,
    pub restored: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedCapture>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugLogsResponse {
    pub logs: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppsResponse {
    pub apps: Vec<AppInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyAppResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotsResponse {
    pub snapshots: Vec<SnapshotSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotResponse {
    pub snapshot: Snapshot,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// --- Push channel ---

/// Message from a push-channel client.
///
/// Fields are optional on the wire so a bad message can still be answered
/// with the action it named.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: Option<String>,
    pub event_type: Option<String>,
    pub component: Option<String>,
}

/// Validated push-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Subscribe(String),
    Monitor(String),
    Unsubscribe(Topic),
    Ping,
}

impl ClientMessage {
    /// Validate the message.
    ///
    /// # Errors
    /// Returns the reason when the action is unknown or a required field
    /// is missing.
    pub fn into_action(self) -> Result<ClientAction, String> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        match self.action.as_deref() {
            Some("subscribe") => non_empty(self.event_type)
                .map(ClientAction::Subscribe)
                .ok_or_else(|| "Missing eventType".to_string()),
            Some("monitor") => non_empty(self.component)
                .map(ClientAction::Monitor)
                .ok_or_else(|| "Missing component".to_string()),
            Some("unsubscribe") => non_empty(self.event_type)
                .map(Topic::EventType)
                .or_else(|| non_empty(self.component).map(Topic::Component))
                .map(ClientAction::Unsubscribe)
                .ok_or_else(|| "Missing eventType or component".to_string()),
            Some("ping") => Ok(ClientAction::Ping),
            Some(_) => Err("Unknown action".to_string()),
            None => Err("Missing action".to_string()),
        }
    }
}

/// Message from the agent to a push-channel client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to a client message.
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Matching agent event.
    Event(AgentEvent),
    /// Current system information, pushed on connect.
    SystemInfo(SystemInfo),
}

impl ServerMessage {
    #[must_use]
    pub fn status(action: &str, status: &str) -> Self {
        Self::Ack {
            action: Some(action.to_string()),
            status: Some(status.to_string()),
            error: None,
        }
    }

    #[must_use]
    pub fn error(action: Option<String>, error: impl Into<String>) -> Self {
        Self::Ack {
            action,
            status: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: ExecuteRequest = serde_json::from_value(json!({"command": "ls"})).unwrap();
        assert_eq!(req.timeout, DEFAULT_TIMEOUT_MS);

        let req: InjectRequest = serde_json::from_value(json!({
            "targetClass": "com.example.Main",
            "methodName": "run",
            "code": "return;"
        }))
        .unwrap();
        assert_eq!(req.language, "native");

        let req: DebugLogsRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!((req.lines, req.filter.as_str()), (100, "AGENT"));
    }

    #[test]
    fn test_client_actions() {
        let parse = |v| serde_json::from_value::<ClientMessage>(v).unwrap().into_action();
        assert_eq!(
            parse(json!({"action": "subscribe", "eventType": "snapshot.created"})),
            Ok(ClientAction::Subscribe("snapshot.created".into()))
        );
        assert_eq!(
            parse(json!({"action": "monitor", "component": "system"})),
            Ok(ClientAction::Monitor("system".into()))
        );
        assert_eq!(
            parse(json!({"action": "unsubscribe", "component": "system"})),
            Ok(ClientAction::Unsubscribe(Topic::Component("system".into())))
        );
        assert_eq!(parse(json!({"action": "subscribe"})), Err("Missing eventType".into()));
        assert_eq!(parse(json!({"action": "dance"})), Err("Unknown action".into()));
    }

    #[test]
    fn test_server_message_shapes() {
        let ack = serde_json::to_value(ServerMessage::status("monitor", "monitoring")).unwrap();
        assert_eq!(
            ack,
            json!({"type": "ack", "action": "monitor", "status": "monitoring"})
        );

        let event = AgentEvent::new("mutation.applied", json!({"target": "a"}));
        let value = serde_json::to_value(ServerMessage::Event(event)).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["eventType"], "mutation.applied");
        assert_eq!(value["component"], "mutation");
    }
}
