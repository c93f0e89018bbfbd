//! Inbound event dispatch: one match per role over the event name, payload
//! deserialization, and the `system:error` reporting contract.
//!
//! Authorization stays at this boundary: a handler only reaches a service
//! once the event is permitted for the connection's principal.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use livedesk_common::models::{AgentState, MessageKind, SenderType};
use livedesk_common::Error;

use crate::auth::Principal;
use crate::broker::{events, topics, Envelope};
use crate::gateway::AppState;
use crate::services::{stats, Placement};

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, Error> {
    serde_json::from_value(data).map_err(|e| Error::Parse(format!("bad event payload: {e}")))
}

fn parse_kind(message_type: Option<String>) -> Result<MessageKind, Error> {
    match message_type {
        Some(t) => MessageKind::from_str(&t),
        None => Ok(MessageKind::Text),
    }
}

/// Report a handler failure on the offending connection. No state change
/// accompanies a contract violation.
pub async fn send_error(state: &AppState, conn_id: Uuid, err: &Error, request_id: Option<String>) {
    warn!(conn = %conn_id, code = err.code(), "handler failed: {err}");
    let envelope = Envelope::new(
        events::SYSTEM_ERROR,
        json!({ "code": err.code(), "message": err.to_string() }),
    )
    .with_request_id(request_id);
    state.broker.send_to(conn_id, envelope).await;
}

// ---------- customer events ----------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartChatData {
    customer_name: Option<String>,
    customer_email: Option<String>,
    source_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageData {
    session_id: Uuid,
    content: String,
    message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingData {
    session_id: Uuid,
    is_typing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRefData {
    session_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RatingData {
    session_id: Uuid,
    rating: i32,
    feedback: Option<String>,
}

pub async fn handle_customer_event(
    state: &AppState,
    conn_id: Uuid,
    principal: &mut Principal,
    envelope: Envelope,
) {
    let request_id = envelope.request_id.clone();
    if let Err(e) = dispatch_customer(state, conn_id, principal, envelope).await {
        send_error(state, conn_id, &e, request_id).await;
    }
}

/// A customer may only act on the session its connection is bound to.
fn check_binding(principal: &Principal, session_id: Uuid) -> Result<(), Error> {
    match principal {
        Principal::Customer { session_id: Some(own), .. } if *own == session_id => Ok(()),
        _ => Err(Error::InvalidSession(session_id)),
    }
}

async fn dispatch_customer(
    state: &AppState,
    conn_id: Uuid,
    principal: &mut Principal,
    envelope: Envelope,
) -> Result<(), Error> {
    let request_id = envelope.request_id.clone();
    match envelope.event.as_str() {
        "customer:start_chat" => {
            if let Principal::Customer { session_id: Some(existing), .. } = principal {
                return Err(Error::InvalidSession(*existing));
            }
            let data: StartChatData = parse(envelope.data)?;
            let session = state
                .session_service
                .create_session(data.customer_name, data.customer_email, data.source_url)
                .await?;
            let session_id = session.session_id;

            *principal = Principal::Customer {
                session_id: Some(session_id),
                customer_token: Some(session.customer_token.clone()),
            };
            state.broker.subscribe(conn_id, &topics::session(session_id));

            let started = Envelope::new(
                events::CHAT_STARTED,
                json!({
                    "sessionId": session_id,
                    "customerToken": session.customer_token,
                }),
            )
            .with_request_id(request_id);
            state.broker.send_to(conn_id, started).await;

            // Placement runs after the subscription so `chat:assigned`
            // cannot slip past this connection.
            if let Placement::Queued { position } =
                state.session_service.place_or_position(session_id).await?
            {
                let queued = Envelope::new(
                    events::CHAT_QUEUE_POSITION,
                    json!({ "sessionId": session_id, "position": position }),
                );
                state.broker.send_to(conn_id, queued).await;
            }
            Ok(())
        }
        "customer:send_message" => {
            let data: SendMessageData = parse(envelope.data)?;
            check_binding(principal, data.session_id)?;
            let kind = parse_kind(data.message_type)?;
            state
                .message_service
                .send_customer_message(data.session_id, &data.content, kind)
                .await?;
            Ok(())
        }
        "customer:typing" => {
            let data: TypingData = parse(envelope.data)?;
            check_binding(principal, data.session_id)?;
            state
                .message_service
                .typing(data.session_id, SenderType::Customer, data.is_typing)
                .await;
            Ok(())
        }
        "customer:end_chat" => {
            let data: SessionRefData = parse(envelope.data)?;
            check_binding(principal, data.session_id)?;
            state.session_service.end_chat(data.session_id).await?;
            Ok(())
        }
        "customer:rating" => {
            let data: RatingData = parse(envelope.data)?;
            check_binding(principal, data.session_id)?;
            state
                .session_service
                .rate(data.session_id, data.rating, data.feedback.as_deref())
                .await?;
            Ok(())
        }
        other => {
            warn!(conn = %conn_id, event = other, "dropping unknown customer event");
            Ok(())
        }
    }
}

// ---------- agent events ----------

#[derive(Debug, Deserialize)]
struct SetStatusData {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveChatData {
    session_id: Uuid,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferChatData {
    session_id: Uuid,
    to_cs_id: Uuid,
}

pub async fn handle_agent_event(
    state: &AppState,
    conn_id: Uuid,
    principal: &Principal,
    envelope: Envelope,
) {
    let request_id = envelope.request_id.clone();
    if let Err(e) = dispatch_agent(state, conn_id, principal, envelope).await {
        send_error(state, conn_id, &e, request_id).await;
    }
}

async fn dispatch_agent(
    state: &AppState,
    conn_id: Uuid,
    principal: &Principal,
    envelope: Envelope,
) -> Result<(), Error> {
    let agent_id = principal
        .agent_id()
        .ok_or_else(|| Error::Auth("staff events need a staff principal".to_string()))?;
    match envelope.event.as_str() {
        "cs:set_status" => {
            let data: SetStatusData = parse(envelope.data)?;
            let status = AgentState::from_str(&data.status)?;
            state.session_service.set_agent_state(agent_id, status).await
        }
        "cs:accept_chat" => {
            let data: SessionRefData = parse(envelope.data)?;
            state
                .session_service
                .accept_chat(agent_id, data.session_id)
                .await
                .map(|_| ())
        }
        "cs:send_message" => {
            let data: SendMessageData = parse(envelope.data)?;
            let kind = parse_kind(data.message_type)?;
            state
                .message_service
                .send_agent_message(agent_id, data.session_id, &data.content, kind)
                .await
                .map(|_| ())
        }
        "cs:typing" => {
            let data: TypingData = parse(envelope.data)?;
            state
                .message_service
                .typing(data.session_id, SenderType::Agent, data.is_typing)
                .await;
            Ok(())
        }
        "cs:resolve_chat" => {
            let data: ResolveChatData = parse(envelope.data)?;
            state
                .session_service
                .resolve_chat(agent_id, data.session_id, data.notes.as_deref())
                .await
                .map(|_| ())
        }
        "cs:transfer_chat" => {
            let data: TransferChatData = parse(envelope.data)?;
            state
                .session_service
                .transfer_chat(agent_id, data.session_id, data.to_cs_id)
                .await
        }
        other => {
            warn!(conn = %conn_id, event = other, "dropping unknown agent event");
            Ok(())
        }
    }
}

// ---------- admin events ----------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceAssignData {
    session_id: Uuid,
    cs_id: Uuid,
}

pub async fn handle_admin_event(
    state: &AppState,
    conn_id: Uuid,
    principal: &Principal,
    envelope: Envelope,
) {
    let request_id = envelope.request_id.clone();
    if let Err(e) = dispatch_admin(state, conn_id, principal, envelope).await {
        send_error(state, conn_id, &e, request_id).await;
    }
}

async fn dispatch_admin(
    state: &AppState,
    conn_id: Uuid,
    principal: &Principal,
    envelope: Envelope,
) -> Result<(), Error> {
    let admin_id = principal
        .agent_id()
        .ok_or_else(|| Error::Auth("admin events need a staff principal".to_string()))?;
    match envelope.event.as_str() {
        "admin:subscribe_stats" => {
            state.broker.subscribe(conn_id, topics::ADMIN_STATS);
            let waiting = state.session_service.sessions().waiting_ordered().await?;
            let snapshot = stats::snapshot(&waiting, &state.registry);
            let frame = Envelope::new(events::STATS_UPDATE, serde_json::to_value(&snapshot)?)
                .with_request_id(envelope.request_id);
            state.broker.send_to(conn_id, frame).await;
            Ok(())
        }
        "admin:force_assign" => {
            let data: ForceAssignData = parse(envelope.data)?;
            state
                .session_service
                .force_assign(admin_id, data.session_id, data.cs_id)
                .await
                .map(|_| ())
        }
        other => {
            warn!(conn = %conn_id, event = other, "dropping unknown admin event");
            Ok(())
        }
    }
}
