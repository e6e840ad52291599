//! Typed agent events fanned out to push-channel subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_millis;

/// An event emitted by an agent component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    /// Dotted event type, e.g. `snapshot.created`.
    pub event_type: String,
    /// Emitting component, the first segment of the event type.
    pub component: String,
    /// Emission time (Unix epoch millis).
    pub timestamp: i64,
    /// Event-specific data.
    pub payload: Value,
}

impl AgentEvent {
    /// Create an event; the component is derived from the event type.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        let event_type = event_type.into();
        let component = event_type
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            event_type,
            component,
            timestamp: now_millis(),
            payload,
        }
    }
}
