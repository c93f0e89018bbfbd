//! Message and typing handling: validate, append to the transcript, fan out
//! on the session topic. The store's append order is the delivery order.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use livedesk_common::error::StoreOp;
use livedesk_common::models::message::validate_content;
use livedesk_common::models::{ChatMessage, MessageKind, SenderType, SessionStatus};
use livedesk_common::traits::{MessageRepository, SessionRepository};
use livedesk_common::Error;

use crate::broker::{events, topics, Broker, Delivery, Envelope};
use crate::config::CoreConfig;
use crate::services::with_deadline;

pub struct MessageService {
    sessions: Arc<dyn SessionRepository>,
    messages: Arc<dyn MessageRepository>,
    broker: Broker,
    config: CoreConfig,
}

impl MessageService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn MessageRepository>,
        broker: Broker,
        config: CoreConfig,
    ) -> Self {
        Self { sessions, messages, broker, config }
    }

    /// Customer message. Accepted while waiting (the transcript records
    /// early messages before an agent joins) and while active.
    pub async fn send_customer_message(
        &self,
        session_id: Uuid,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChatMessage, Error> {
        let content = validate_content(content)?;
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.is_terminal() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        let message = ChatMessage::customer(session_id, content, kind);
        self.append_and_publish(message).await
    }

    /// Agent message. Only the assigned agent may write, and only while the
    /// session is active.
    pub async fn send_agent_message(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChatMessage, Error> {
        let content = validate_content(content)?;
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Active
            || session.assigned_agent_id != Some(agent_id)
        {
            return Err(Error::NotAssigned { agent_id, session_id });
        }

        let message = ChatMessage::agent(session_id, agent_id, content, kind);
        self.append_and_publish(message).await
    }

    async fn append_and_publish(&self, message: ChatMessage) -> Result<ChatMessage, Error> {
        with_deadline(self.config.store_deadline, self.messages.append(&message))
            .await
            .map_err(|e| match e {
                e @ Error::StoreFailed { .. } => e,
                other => Error::store(StoreOp::Send, other),
            })?;

        self.broker
            .publish(
                &topics::session(message.session_id),
                Envelope::new(events::CHAT_MESSAGE, json!(message)),
                Delivery::Guaranteed,
            )
            .await;

        Ok(message)
    }

    /// Typing indicators never touch the store and may be dropped.
    pub async fn typing(&self, session_id: Uuid, sender: SenderType, is_typing: bool) {
        let event = match sender {
            SenderType::Customer => events::CHAT_CUSTOMER_TYPING,
            _ => events::CHAT_CS_TYPING,
        };
        self.broker
            .publish(
                &topics::session(session_id),
                Envelope::new(
                    event,
                    json!({ "sessionId": session_id, "isTyping": is_typing }),
                ),
                Delivery::BestEffort,
            )
            .await;
    }
}
