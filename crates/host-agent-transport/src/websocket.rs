//! Push channel: WebSocket event streaming.
//!
//! A connection receives the current [`SystemInfo`](crate::system_info::SystemInfo)
//! on open, then every event matching its subscriptions.

use axum::{
    Router,
    extract::{
        Query, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{Sink, SinkExt, StreamExt};
use host_agent_core::{AgentEvent, ConnectionId, EventHub, Topic};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    protocol::{ClientAction, ClientMessage, ServerMessage},
    router::ApiError,
    state::AgentState,
};

/// Pending acknowledgements per connection; the reader waits when full.
const ACK_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Build the push-channel router, serving `/ws`.
///
/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also be passed as `?token=`.
pub fn ws_router(state: AgentState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(State(state): State<AgentState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let authorized = match header {
        Some(_) => state.credentials.authorize_header(header).is_ok(),
        None => Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.token)
            .is_some_and(|token| state.credentials.is_valid(&token)),
    };
    if !authorized {
        tracing::warn!("rejected push-channel connection");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AgentState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AgentState) {
    let connection_id = Uuid::new_v4();
    let events = state.events.register(connection_id);
    let (sender, mut receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<ServerMessage>(ACK_QUEUE_CAPACITY);
    let _ = tx
        .send(ServerMessage::SystemInfo(state.system.collect().await))
        .await;
    let send_task = tokio::spawn(pump_outbound(sender, rx, events));

    tracing::info!(%connection_id, "push channel connected");

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(%connection_id, "WebSocket error: {e}");
                break;
            }
        };
        if tx
            .send(handle_client_text(&state.events, connection_id, &text))
            .await
            .is_err()
        {
            break;
        }
    }

    let removed = state.events.disconnect(connection_id);
    send_task.abort();
    tracing::info!(%connection_id, removed, "push channel disconnected");
}

/// Write acknowledgements and hub events to the client until either side
/// closes.
///
/// Events leave the hub queue only as fast as the client takes them, so a
/// stalled client backs up into that bounded queue and the hub starts
/// dropping its events.
async fn pump_outbound<S>(
    mut sink: S,
    mut acks: mpsc::Receiver<ServerMessage>,
    mut events: mpsc::Receiver<AgentEvent>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let msg = tokio::select! {
            ack = acks.recv() => match ack {
                Some(ack) => ack,
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => ServerMessage::Event(event),
                None => break,
            },
        };
        let json = match serde_json::to_string(&msg) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Apply one client message to the hub and build the acknowledgement.
#[must_use]
pub fn handle_client_text(hub: &EventHub, connection_id: ConnectionId, text: &str) -> ServerMessage {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(%connection_id, "Invalid client message: {e}");
            return ServerMessage::error(None, format!("Invalid message: {e}"));
        }
    };
    let action = msg.action.clone();
    let subscribe = |topic: Topic, status: &str| match hub.subscribe(connection_id, topic) {
        Ok(_) => ServerMessage::status(action.as_deref().unwrap_or_default(), status),
        Err(e) => ServerMessage::error(action.clone(), e.to_string()),
    };

    match msg.into_action() {
        Ok(ClientAction::Subscribe(event_type)) => {
            subscribe(Topic::EventType(event_type), "subscribed")
        }
        Ok(ClientAction::Monitor(component)) => {
            subscribe(Topic::Component(component), "monitoring")
        }
        Ok(ClientAction::Unsubscribe(topic)) => {
            hub.unsubscribe(connection_id, &topic);
            ServerMessage::status("unsubscribe", "unsubscribed")
        }
        Ok(ClientAction::Ping) => ServerMessage::status("ping", "pong"),
        Err(reason) => ServerMessage::error(action, reason),
    }
}
