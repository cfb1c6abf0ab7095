//! WebSocket endpoints.
//!
//! `/ws/chat` is the authenticated surface: the socket must present a valid
//! token (query, `Authorization` header, or an `auth` event) within the
//! handshake window or it is disconnected with `error:auth`. `/ws/media` is
//! the anonymous conference surface. Both share the hub: one writer task
//! drains the socket's outbound channel, the reader dispatches one event at
//! a time, so per-socket handler ordering is the transport ordering.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use confab_core::models::{generate_id, SocketId, UserId};
use confab_core::Result;

use crate::chat::MessagingGateway;
use crate::connection::ConnectionSupervisor;
use crate::hub::ClusterHub;
use crate::media_gateway::StreamingGateway;
use crate::protocol::{ack_error, auth_codes, events, ClientEnvelope, ServerEnvelope};

#[derive(Clone)]
pub struct ApiState {
    pub cluster: ClusterHub,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub chat: Arc<MessagingGateway>,
    pub media: Arc<StreamingGateway>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Build the socket router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ws/chat", get(chat_handler))
        .route("/ws/media", get(media_handler))
        .with_state(state)
}

async fn chat_handler(
    State(state): State<ApiState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorization = headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| chat_socket(socket, state, query.token, authorization))
}

async fn media_handler(
    State(state): State<ApiState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(256 * 1024)
        .on_upgrade(move |socket| media_socket(socket, state))
}

/// Spawn the writer task draining the hub channel into the sink.
fn spawn_writer(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<ServerEnvelope>,
    close: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                () = close.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    })
}

async fn chat_socket(
    socket: WebSocket,
    state: ApiState,
    query_token: Option<String>,
    authorization: Option<String>,
) {
    let socket_id = SocketId::from_string(generate_id());
    let (outbound, close) = state.cluster.hub().register(&socket_id);
    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, outbound, close.clone());

    tracing::info!(socket_id = %socket_id, "Chat socket connected");

    let mut user: Option<UserId> = None;

    // Token already present at the handshake: validate before reading.
    let initial_token =
        ConnectionSupervisor::extract_token(query_token.as_deref(), authorization.as_deref(), None);
    if let Some(token) = initial_token {
        match state.supervisor.authenticate(&socket_id, &token).await {
            Ok(session) => user = Some(session.user_id),
            Err(e) => {
                auth_reject(&state, &socket_id, auth_codes::AUTH_FAILED, &e.to_string());
                finish_chat_socket(&state, &socket_id, writer).await;
                return;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + state.supervisor.handshake_timeout();

    loop {
        let message = if user.is_some() {
            tokio::select! {
                () = close.cancelled() => break,
                message = stream.next() => message,
            }
        } else {
            // Unauthenticated sockets race the handshake window.
            tokio::select! {
                () = close.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => {
                    auth_reject(&state, &socket_id, auth_codes::AUTH_TIMEOUT, "Authentication timed out");
                    break;
                }
                message = stream.next() => message,
            }
        };

        let Some(Ok(message)) = message else { break };
        let Message::Text(text) = message else {
            continue;
        };
        let envelope: ClientEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(socket_id = %socket_id, error = %e, "Malformed chat frame");
                continue;
            }
        };

        if envelope.event == events::AUTH {
            if user.is_some() {
                continue;
            }
            let token = envelope
                .data
                .get("token")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            match state.supervisor.authenticate(&socket_id, &token).await {
                Ok(session) => {
                    user = Some(session.user_id.clone());
                    if let Some(ack_id) = envelope.ack_id {
                        state.cluster.ack(
                            &socket_id,
                            ack_id,
                            serde_json::json!({
                                "ok": true,
                                "userId": session.user_id,
                                "rooms": session.rooms,
                            }),
                        );
                    }
                }
                Err(e) => {
                    auth_reject(&state, &socket_id, auth_codes::AUTH_FAILED, &e.to_string());
                    break;
                }
            }
            continue;
        }

        let Some(user_id) = user.clone() else {
            // Everything except `auth` requires an authenticated socket.
            if let Some(ack_id) = envelope.ack_id {
                state
                    .cluster
                    .ack(&socket_id, ack_id, ack_error("Not authenticated"));
            }
            continue;
        };

        let outcome = dispatch_chat(&state, &socket_id, &user_id, &envelope).await;
        handle_dispatch_outcome(&state, &socket_id, &envelope, outcome);
    }

    state.supervisor.on_disconnect(&socket_id).await;
    finish_chat_socket(&state, &socket_id, writer).await;
}

fn auth_reject(state: &ApiState, socket_id: &SocketId, code: &str, error: &str) {
    state.cluster.emit(
        socket_id,
        events::ERROR_AUTH,
        serde_json::json!({ "error": error, "code": code }),
    );
    // Give the writer a chance to flush before the close frame.
    let cluster = state.cluster.clone();
    let socket_id = socket_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.hub().disconnect_local(&[socket_id]);
    });
}

async fn finish_chat_socket(
    state: &ApiState,
    socket_id: &SocketId,
    writer: tokio::task::JoinHandle<()>,
) {
    state.cluster.hub().unregister(socket_id);
    writer.abort();
    tracing::info!(socket_id = %socket_id, "Chat socket closed");
}

/// Ack the handler's reply, or apply the connection-fault policy: log,
/// answer a generic failure, and drop the socket when the shared store is
/// gone (its session and lock guarantees no longer hold).
fn handle_dispatch_outcome(
    state: &ApiState,
    socket_id: &SocketId,
    envelope: &ClientEnvelope,
    outcome: Result<Option<serde_json::Value>>,
) {
    match outcome {
        Ok(ack) => {
            if let (Some(ack_id), Some(ack)) = (envelope.ack_id, ack) {
                state.cluster.ack(socket_id, ack_id, ack);
            }
        }
        Err(e) => {
            tracing::error!(
                socket_id = %socket_id,
                event = %envelope.event,
                error = %e,
                "Handler fault"
            );
            if let Some(ack_id) = envelope.ack_id {
                state
                    .cluster
                    .ack(socket_id, ack_id, ack_error("Internal error"));
            }
            if e.requires_disconnect() {
                tracing::warn!(
                    socket_id = %socket_id,
                    "Shared store unavailable, disconnecting socket"
                );
                state.cluster.hub().disconnect_local(&[socket_id.clone()]);
            }
        }
    }
}

async fn dispatch_chat(
    state: &ApiState,
    socket_id: &SocketId,
    user_id: &UserId,
    envelope: &ClientEnvelope,
) -> Result<Option<serde_json::Value>> {
    let data = envelope.data.clone();
    match envelope.event.as_str() {
        events::MESSAGE_SEND => state
            .chat
            .handle_send(socket_id, user_id, data)
            .await
            .map(Some),
        events::MESSAGE_PIN | events::MESSAGE_UNPIN | events::MESSAGE_READ => state
            .chat
            .handle_message_ref(&envelope.event, user_id, data)
            .await
            .map(Some),
        events::MESSAGE_TYPING => Ok(Some(state.chat.handle_typing(socket_id, user_id, data))),
        events::ROOM_JOIN | events::CHAT_ROOM_JOIN => {
            let room_id = data
                .get("roomId")
                .or_else(|| data.get("jobId"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Some(state.chat.handle_room_join(socket_id, &room_id)))
        }
        events::CHAT_ROOM_LEAVE => {
            let room_id = data
                .get("roomId")
                .or_else(|| data.get("jobId"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Some(state.chat.handle_room_leave(socket_id, &room_id)))
        }
        other => {
            tracing::debug!(event = %other, "Unknown chat event");
            Ok(Some(ack_error(&format!("Unknown event: {other}"))))
        }
    }
}

async fn media_socket(socket: WebSocket, state: ApiState) {
    let socket_id = SocketId::from_string(generate_id());
    let (outbound, close) = state.cluster.hub().register(&socket_id);
    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, outbound, close.clone());

    tracing::info!(socket_id = %socket_id, "Media socket connected");

    loop {
        let message = tokio::select! {
            () = close.cancelled() => break,
            message = stream.next() => message,
        };
        let Some(Ok(message)) = message else { break };
        let Message::Text(text) = message else {
            continue;
        };
        let envelope: ClientEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(socket_id = %socket_id, error = %e, "Malformed media frame");
                continue;
            }
        };

        let outcome = dispatch_media(&state, &socket_id, &envelope).await;
        handle_dispatch_outcome(&state, &socket_id, &envelope, outcome);
    }

    state.media.on_disconnect(&socket_id).await;
    state.cluster.hub().unregister(&socket_id);
    writer.abort();
    tracing::info!(socket_id = %socket_id, "Media socket closed");
}

async fn dispatch_media(
    state: &ApiState,
    socket_id: &SocketId,
    envelope: &ClientEnvelope,
) -> Result<Option<serde_json::Value>> {
    let data = envelope.data.clone();
    let media = &state.media;
    match envelope.event.as_str() {
        events::JOIN_ROOM => media.join_room(socket_id, data).await.map(Some),
        events::LEAVE_ROOM => media.leave_room(socket_id).await.map(Some),
        events::REQUEST_TRANSPORT => media.request_transport(socket_id, data).await.map(Some),
        events::CONNECT_TRANSPORT => media.connect_transport(socket_id, data).await.map(Some),
        events::START_PRODUCING => media.start_producing(socket_id, data).await.map(Some),
        events::CONSUME_MEDIA => media.consume_media(socket_id, data).await.map(Some),
        events::UNPAUSE_CONSUMER => media.unpause_consumer(socket_id, data).await.map(Some),
        events::AUDIO_CHANGE => media.audio_change(socket_id, data).await.map(Some),
        events::CLOSE_PRODUCERS => media.close_producers(socket_id, data).await.map(Some),
        other => {
            tracing::debug!(event = %other, "Unknown media event");
            Ok(Some(ack_error(&format!("Unknown event: {other}"))))
        }
    }
}
