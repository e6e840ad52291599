//! Operator-facing surfaces of the host agent.
//!
//! Provides:
//! - Wire protocol (JSON requests, responses and push messages)
//! - Authenticated request/response API
//! - WebSocket push channel with per-connection subscriptions
//! - System information probe and heartbeat

pub mod protocol;
pub mod router;
pub mod state;
pub mod system_info;
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};
pub use router::{ApiError, ValidationError, api_router};
pub use state::AgentState;
pub use system_info::{SystemInfo, SystemProbe, spawn_heartbeat};
pub use websocket::{handle_client_text, ws_router};
