//! WebSocket upgrade handlers and per-connection socket loops.
//!
//! Each connection gets a writer task draining its broker queue into the
//! socket, and a read loop that handles one inbound frame at a time, so a
//! client can never race against itself.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use livedesk_common::models::StaffRole;

use crate::auth::{AuthedStaff, Principal};
use crate::broker::{events, topics, Envelope};
use crate::gateway::handlers;
use crate::gateway::AppState;

/// Close codes from the wire contract.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
pub const CLOSE_FORBIDDEN: u16 = 4403;
pub const CLOSE_IDLE_TIMEOUT: u16 = 4408;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn customer_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| customer_socket(socket, state, query.token))
}

pub async fn cs_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let staff = authenticate_bearer(&state, query.token.as_deref()).await;
    ws.on_upgrade(move |socket| agent_socket(socket, state, staff))
}

pub async fn admin_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let staff = authenticate_bearer(&state, query.token.as_deref()).await;
    ws.on_upgrade(move |socket| admin_socket(socket, state, staff))
}

async fn authenticate_bearer(state: &AppState, token: Option<&str>) -> Option<AuthedStaff> {
    let token = token?;
    match state.authenticator.authenticate(token).await {
        Ok(staff) => Some(staff),
        Err(e) => {
            warn!("gateway rejected bearer token: {e}");
            None
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

/// Spawn the writer task that drains the connection's broker queue.
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: tokio::sync::mpsc::Receiver<Envelope>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(t) => t,
                Err(e) => {
                    warn!("failed to encode outbound frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    })
}

/// The frame after which a customer socket has nothing left to say: the
/// idle reaper abandoned the session, so the connection closes with 4408.
fn ends_customer_connection(envelope: &Envelope) -> bool {
    envelope.event == events::CHAT_ENDED
        && envelope.data.get("reason").and_then(|v| v.as_str()) == Some("idle")
}

/// Customer variant of the writer: forwards frames, and after the idle
/// `chat:ended` frame closes the socket with the idle-timeout code.
fn spawn_customer_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: tokio::sync::mpsc::Receiver<Envelope>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let idle_close = ends_customer_connection(&envelope);
            let text = match serde_json::to_string(&envelope) {
                Ok(t) => t,
                Err(e) => {
                    warn!("failed to encode outbound frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if idle_close {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_IDLE_TIMEOUT,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    })
}

async fn customer_socket(socket: WebSocket, state: AppState, resume_token: Option<String>) {
    // A resume token must resolve before we commit to the connection.
    let mut principal = Principal::latent_customer();
    let mut restored = None;
    if let Some(token) = resume_token {
        match state.session_service.restore_by_token(&token).await {
            Ok((session, transcript, agent)) => {
                principal = Principal::Customer {
                    session_id: Some(session.session_id),
                    customer_token: Some(token),
                };
                restored = Some((session, transcript, agent));
            }
            Err(e) => {
                warn!("customer resume failed: {e}");
                close_with(socket, CLOSE_FORBIDDEN, "unknown session token").await;
                return;
            }
        }
    }

    let conn_id = Uuid::new_v4();
    let outbound = state.broker.register(conn_id);
    let (sink, mut stream) = socket.split();
    let writer = spawn_customer_writer(sink, outbound);

    if let Some((session, transcript, agent)) = restored {
        state
            .broker
            .subscribe(conn_id, &topics::session(session.session_id));
        let frame = Envelope::new(
            events::SESSION_RESTORED,
            json!({
                "sessionId": session.session_id,
                "status": session.status,
                "assignedCs": agent.map(|u| json!({ "id": u.user_id, "name": u.public_name() })),
                "messages": transcript,
            }),
        );
        state.broker.send_to(conn_id, frame).await;
        info!(conn = %conn_id, session = %session.session_id, "customer reconnected");
    } else {
        debug!(conn = %conn_id, "customer connected without a session");
    }

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(conn = %conn_id, "dropping malformed customer frame: {e}");
                        continue;
                    }
                };
                handlers::handle_customer_event(&state, conn_id, &mut principal, envelope)
                    .await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.broker.unregister(conn_id);
    if let Principal::Customer { session_id: Some(session_id), .. } = principal {
        state.session_service.customer_disconnected(session_id).await;
    }
    writer.abort();
    debug!(conn = %conn_id, "customer connection closed");
}

async fn agent_socket(socket: WebSocket, state: AppState, staff: Option<AuthedStaff>) {
    let staff = match staff {
        Some(staff) => staff,
        None => {
            close_with(socket, CLOSE_UNAUTHENTICATED, "authentication required").await;
            return;
        }
    };

    let principal = Principal::Agent { user_id: staff.user_id, role: staff.role };
    let conn_id = Uuid::new_v4();
    let outbound = state.broker.register(conn_id);
    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, outbound);

    state.broker.subscribe(conn_id, &topics::agent(staff.user_id));
    state.broker.subscribe(conn_id, topics::QUEUE);

    // Re-attach to every chat this agent still owns.
    match state
        .session_service
        .sessions()
        .active_for_agent(staff.user_id)
        .await
    {
        Ok(active) => {
            for session in &active {
                state
                    .broker
                    .subscribe(conn_id, &topics::session(session.session_id));
            }
            if !active.is_empty() {
                info!(agent = %staff.user_id, chats = active.len(), "agent re-attached to active chats");
            }
        }
        Err(e) => warn!(agent = %staff.user_id, "could not load active chats: {e}"),
    }

    info!(conn = %conn_id, agent = %staff.user_id, "agent connected");

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(conn = %conn_id, "dropping malformed agent frame: {e}");
                        continue;
                    }
                };
                handlers::handle_agent_event(&state, conn_id, &principal, envelope).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.broker.unregister(conn_id);
    // Flaky staff sockets force presence offline; assigned chats are kept.
    state.session_service.agent_disconnected(staff.user_id).await;
    writer.abort();
    info!(conn = %conn_id, agent = %staff.user_id, "agent connection closed");
}

async fn admin_socket(socket: WebSocket, state: AppState, staff: Option<AuthedStaff>) {
    let staff = match staff {
        Some(staff) => staff,
        None => {
            close_with(socket, CLOSE_UNAUTHENTICATED, "authentication required").await;
            return;
        }
    };
    if staff.role != StaffRole::Admin {
        close_with(socket, CLOSE_FORBIDDEN, "admin role required").await;
        return;
    }

    let principal = Principal::Agent { user_id: staff.user_id, role: staff.role };
    let conn_id = Uuid::new_v4();
    let outbound = state.broker.register(conn_id);
    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, outbound);

    state.broker.subscribe(conn_id, topics::ADMIN_STATS);
    state.broker.subscribe(conn_id, topics::QUEUE);

    info!(conn = %conn_id, admin = %staff.user_id, "admin connected");

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(conn = %conn_id, "dropping malformed admin frame: {e}");
                        continue;
                    }
                };
                handlers::handle_admin_event(&state, conn_id, &principal, envelope).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.broker.unregister(conn_id);
    writer.abort();
    debug!(conn = %conn_id, "admin connection closed");
}
