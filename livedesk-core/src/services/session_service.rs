//! Session lifecycle: waiting -> active -> {resolved, abandoned}.
//!
//! Every transition runs as one store transaction (the repository owns the
//! atomicity); this service layers the capacity mirror, the broker fan-out,
//! and the audit trail on top of the committed result.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use livedesk_common::error::StoreOp;
use livedesk_common::models::{
    ActivityLogEntry, AgentState, ChatMessage, ChatSession, SessionStatus, User,
};
use livedesk_common::traits::{
    ActivityLogRepository, AssignmentRecord, ClosureRecord, MessageRepository,
    PresenceRepository, SessionRepository, UserRepository,
};
use livedesk_common::Error;

use crate::auth::generate_customer_token;
use crate::broker::{events, topics, Broker, Delivery, Envelope};
use crate::config::CoreConfig;
use crate::registry::{PresenceRegistry, ReserveOutcome};
use crate::services::dispatcher::DispatchHandle;
use crate::services::{stats, with_deadline};

/// How an assignment was initiated; decides which wire code a capacity
/// failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignKind {
    /// Dispatcher pulled the queue head.
    Auto,
    /// Agent claimed the chat itself.
    Accept,
    /// Admin pinned another agent.
    Force,
}

/// What `start_chat` produced: either an immediate assignment or a queue
/// slot.
#[derive(Debug, Clone)]
pub struct StartChatOutcome {
    pub session: ChatSession,
    pub placement: Placement,
}

/// Where a fresh session ended up.
#[derive(Debug, Clone)]
pub enum Placement {
    Assigned {
        record: AssignmentRecord,
        agent: Option<User>,
    },
    Queued {
        position: usize,
    },
}

pub struct SessionService {
    sessions: Arc<dyn SessionRepository>,
    messages: Arc<dyn MessageRepository>,
    presence: Arc<dyn PresenceRepository>,
    users: Arc<dyn UserRepository>,
    activity: Arc<dyn ActivityLogRepository>,
    registry: Arc<PresenceRegistry>,
    broker: Broker,
    dispatch: DispatchHandle,
    config: CoreConfig,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn MessageRepository>,
        presence: Arc<dyn PresenceRepository>,
        users: Arc<dyn UserRepository>,
        activity: Arc<dyn ActivityLogRepository>,
        registry: Arc<PresenceRegistry>,
        broker: Broker,
        dispatch: DispatchHandle,
        config: CoreConfig,
    ) -> Self {
        Self {
            sessions,
            messages,
            presence,
            users,
            activity,
            registry,
            broker,
            dispatch,
            config,
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<dyn SessionRepository> {
        &self.sessions
    }

    pub fn messages(&self) -> &Arc<dyn MessageRepository> {
        &self.messages
    }

    pub fn users(&self) -> &Arc<dyn UserRepository> {
        &self.users
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn log_activity(&self, entry: ActivityLogEntry) {
        let activity = Arc::clone(&self.activity);
        tokio::spawn(async move {
            if let Err(e) = activity.insert(&entry).await {
                warn!("activity log write failed: {e}");
            }
        });
    }

    /// Create a new waiting session with its welcome entry and announce it
    /// on the queue topic. Placement happens separately so a live
    /// connection can subscribe to the session topic first.
    pub async fn create_session(
        &self,
        customer_name: Option<String>,
        customer_email: Option<String>,
        source_url: Option<String>,
    ) -> Result<ChatSession, Error> {
        let token = generate_customer_token();
        let session = ChatSession::new(token, customer_name, customer_email, source_url);
        let session_id = session.session_id;

        with_deadline(self.config.store_deadline, self.sessions.create(&session))
            .await
            .map_err(|e| Error::store(StoreOp::Init, e))?;

        let welcome = ChatMessage::system(session_id, "Chat started");
        with_deadline(self.config.store_deadline, self.messages.append(&welcome))
            .await
            .map_err(|e| Error::store(StoreOp::Init, e))?;

        info!(session = %session_id, "chat session created");

        self.broker
            .publish(
                topics::QUEUE,
                Envelope::new(
                    events::QUEUE_NEW_CHAT,
                    json!({ "sessionId": session_id, "session": session }),
                ),
                Delivery::Guaranteed,
            )
            .await;

        Ok(session)
    }

    /// Hand a fresh session straight to an available agent, or report its
    /// queue position.
    pub async fn place_or_position(&self, session_id: Uuid) -> Result<Placement, Error> {
        if self.config.auto_assign_enabled {
            if let Some(record) = self.try_place(session_id).await {
                let agent = self.users.get(record.agent.user_id).await.ok().flatten();
                return Ok(Placement::Assigned { record, agent });
            }
        }

        let waiting = self.sessions.waiting_ordered().await?;
        let position = stats::position_of(&waiting, session_id).unwrap_or(1);
        stats::publish_queue_state_quiet(&self.sessions, &self.registry, &self.broker).await;

        Ok(Placement::Queued { position })
    }

    /// Convenience used by the REST surface: create and place in one call.
    pub async fn start_chat(
        &self,
        customer_name: Option<String>,
        customer_email: Option<String>,
        source_url: Option<String>,
    ) -> Result<StartChatOutcome, Error> {
        let session = self
            .create_session(customer_name, customer_email, source_url)
            .await?;
        let placement = self.place_or_position(session.session_id).await?;
        let session = match &placement {
            Placement::Assigned { record, .. } => record.session.clone(),
            Placement::Queued { .. } => session,
        };
        Ok(StartChatOutcome { session, placement })
    }

    /// One placement attempt against the current agent pool. Used by
    /// `start_chat` and the dispatcher; returns `None` when nobody can take
    /// the session.
    pub async fn try_place(&self, session_id: Uuid) -> Option<AssignmentRecord> {
        loop {
            let candidate = self.registry.available().into_iter().next()?;
            match self
                .assign_session(session_id, candidate.user_id, AssignKind::Auto)
                .await
            {
                Ok(record) => return Some(record),
                // Lost the session to a competing claim: stop trying.
                Err(Error::AlreadyAssigned(_)) | Err(Error::SessionNotFound(_)) => return None,
                // Lost the agent: pick the next one.
                Err(Error::AtCapacity(_)) | Err(Error::NotOnline(_)) => continue,
                Err(e) => {
                    warn!(session = %session_id, "auto-assignment failed: {e}");
                    return None;
                }
            }
        }
    }

    /// Agent claims a waiting chat.
    pub async fn accept_chat(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
    ) -> Result<AssignmentRecord, Error> {
        self.assign_session(session_id, agent_id, AssignKind::Accept)
            .await
    }

    /// Admin pins a waiting chat onto a specific agent.
    pub async fn force_assign(
        &self,
        admin_id: Uuid,
        session_id: Uuid,
        agent_id: Uuid,
    ) -> Result<AssignmentRecord, Error> {
        let record = self
            .assign_session(session_id, agent_id, AssignKind::Force)
            .await?;
        self.log_activity(ActivityLogEntry::new(
            Some(admin_id),
            "chat_force_assigned",
            Some(session_id),
            Some(&agent_id.to_string()),
        ));
        Ok(record)
    }

    /// The single assignment path: reserve the capacity mirror, run the
    /// store transaction, then fan out. The store has the final word; a
    /// mirror reservation that the store refuses is rolled back.
    async fn assign_session(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        kind: AssignKind,
    ) -> Result<AssignmentRecord, Error> {
        let agent_user = self
            .users
            .get(agent_id)
            .await?
            .ok_or_else(|| Self::offline_error(agent_id, kind))?;

        match self.registry.reserve(agent_id) {
            ReserveOutcome::Reserved(_) => {}
            ReserveOutcome::AtCapacity => return Err(Self::capacity_error(agent_id, kind)),
            ReserveOutcome::NotOnline => return Err(Self::offline_error(agent_id, kind)),
        }

        let note = format!("{} joined the chat", agent_user.public_name());
        let record = match with_deadline(
            self.config.store_deadline,
            self.sessions.assign(session_id, agent_id, &note),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                self.registry.release(agent_id);
                // The mirror said yes but the store said no: resync it.
                let mapped = match e {
                    Error::AtCapacity(id) => {
                        let _ = self.audit_capacity(id).await;
                        Self::capacity_error(id, kind)
                    }
                    Error::NotOnline(id) => {
                        let _ = self.audit_capacity(id).await;
                        Self::offline_error(id, kind)
                    }
                    other => other,
                };
                return Err(mapped);
            }
        };

        // The committed row replaces the optimistic reservation.
        self.registry.apply(&record.agent);

        info!(session = %session_id, agent = %agent_id, ?kind, "chat assigned");

        let session_topic = topics::session(session_id);
        for conn in self.broker.subscribers(&topics::agent(agent_id)) {
            self.broker.subscribe(conn, &session_topic);
        }

        self.broker
            .publish(
                &session_topic,
                Envelope::new(events::CHAT_MESSAGE, json!(record.system_message)),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &session_topic,
                Envelope::new(
                    events::CHAT_ASSIGNED,
                    json!({
                        "sessionId": session_id,
                        "cs": { "id": agent_id, "name": agent_user.public_name() },
                    }),
                ),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &topics::agent(agent_id),
                Envelope::new(
                    events::CHAT_NEW_ASSIGNED,
                    json!({ "sessionId": session_id, "session": record.session }),
                ),
                Delivery::Guaranteed,
            )
            .await;

        stats::publish_queue_state_quiet(&self.sessions, &self.registry, &self.broker).await;

        self.log_activity(ActivityLogEntry::new(
            Some(agent_id),
            "chat_assigned",
            Some(session_id),
            None,
        ));

        Ok(record)
    }

    fn capacity_error(agent_id: Uuid, kind: AssignKind) -> Error {
        match kind {
            AssignKind::Force => Error::TargetAtCapacity(agent_id),
            _ => Error::AtCapacity(agent_id),
        }
    }

    fn offline_error(agent_id: Uuid, kind: AssignKind) -> Error {
        match kind {
            AssignKind::Force => Error::TargetNotOnline(agent_id),
            _ => Error::NotOnline(agent_id),
        }
    }

    /// Hand an active chat to another agent. Source keeps the chat on any
    /// failure.
    pub async fn transfer_chat(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
        to_agent_id: Uuid,
    ) -> Result<(), Error> {
        if agent_id == to_agent_id {
            return Err(Error::store(
                StoreOp::Transfer,
                "cannot transfer a chat to its current owner",
            ));
        }

        let target_user = self
            .users
            .get(to_agent_id)
            .await?
            .ok_or(Error::TargetNotOnline(to_agent_id))?;

        let note = format!("Chat transferred to {}", target_user.public_name());
        let record = with_deadline(
            self.config.store_deadline,
            self.sessions
                .transfer(session_id, agent_id, to_agent_id, &note),
        )
        .await?;

        self.registry.apply(&record.from_agent);
        self.registry.apply(&record.to_agent);

        info!(session = %session_id, from = %agent_id, to = %to_agent_id, "chat transferred");

        let session_topic = topics::session(session_id);
        for conn in self.broker.subscribers(&topics::agent(to_agent_id)) {
            self.broker.subscribe(conn, &session_topic);
        }

        self.broker
            .publish(
                &session_topic,
                Envelope::new(events::CHAT_MESSAGE, json!(record.system_message)),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &session_topic,
                Envelope::new(
                    events::CHAT_TRANSFERRED,
                    json!({
                        "sessionId": session_id,
                        "newCs": { "id": to_agent_id, "name": target_user.public_name() },
                    }),
                ),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &topics::agent(agent_id),
                Envelope::new(
                    events::CHAT_TRANSFERRED_OUT,
                    json!({ "sessionId": session_id, "toCsId": to_agent_id }),
                ),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &topics::agent(to_agent_id),
                Envelope::new(
                    events::CHAT_TRANSFERRED_IN,
                    json!({ "sessionId": session_id, "session": record.session }),
                ),
                Delivery::Guaranteed,
            )
            .await;

        // The departing agent's connections leave the room last, so they
        // still see the hand-off frames.
        for conn in self.broker.subscribers(&topics::agent(agent_id)) {
            self.broker.unsubscribe(conn, &session_topic);
        }

        self.log_activity(ActivityLogEntry::new(
            Some(agent_id),
            "chat_transferred",
            Some(session_id),
            Some(&to_agent_id.to_string()),
        ));

        // Source freed one slot; the queue may be placeable again.
        self.dispatch.nudge();
        stats::publish_queue_state_quiet(&self.sessions, &self.registry, &self.broker).await;

        Ok(())
    }

    /// Agent closes out an active chat.
    pub async fn resolve_chat(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
        notes: Option<&str>,
    ) -> Result<ClosureRecord, Error> {
        let record = with_deadline(
            self.config.store_deadline,
            self.sessions
                .resolve(session_id, agent_id, notes, "Chat resolved"),
        )
        .await?;

        if let Some(released) = &record.released {
            self.registry.apply(released);
        }

        info!(session = %session_id, agent = %agent_id, "chat resolved");

        let session_topic = topics::session(session_id);
        self.broker
            .publish(
                &session_topic,
                Envelope::new(events::CHAT_MESSAGE, json!(record.system_message)),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &session_topic,
                Envelope::new(
                    events::CHAT_ENDED,
                    json!({ "sessionId": session_id, "reason": "resolved" }),
                ),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &topics::agent(agent_id),
                Envelope::new(events::CHAT_RESOLVED, json!({ "sessionId": session_id })),
                Delivery::Guaranteed,
            )
            .await;

        for conn in self.broker.subscribers(&topics::agent(agent_id)) {
            self.broker.unsubscribe(conn, &session_topic);
        }

        self.log_activity(ActivityLogEntry::new(
            Some(agent_id),
            "chat_resolved",
            Some(session_id),
            None,
        ));

        self.dispatch.nudge();
        stats::publish_queue_state_quiet(&self.sessions, &self.registry, &self.broker).await;

        Ok(record)
    }

    /// Customer walks away explicitly.
    pub async fn end_chat(&self, session_id: Uuid) -> Result<ClosureRecord, Error> {
        self.close_session(session_id, "Customer ended the chat", "customer", None)
            .await
    }

    /// Idle reaper fired for this session.
    pub async fn abandon_idle(&self, session_id: Uuid) -> Result<ClosureRecord, Error> {
        self.close_session(session_id, "Chat closed due to inactivity", "idle", None)
            .await
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        note: &str,
        reason: &str,
        actor: Option<Uuid>,
    ) -> Result<ClosureRecord, Error> {
        let record = with_deadline(
            self.config.store_deadline,
            self.sessions.abandon(session_id, note),
        )
        .await?;

        if let Some(released) = &record.released {
            self.registry.apply(released);
        }

        info!(session = %session_id, reason, "chat abandoned");

        let session_topic = topics::session(session_id);
        self.broker
            .publish(
                &session_topic,
                Envelope::new(events::CHAT_MESSAGE, json!(record.system_message)),
                Delivery::Guaranteed,
            )
            .await;
        self.broker
            .publish(
                &session_topic,
                Envelope::new(
                    events::CHAT_ENDED,
                    json!({ "sessionId": session_id, "reason": reason }),
                ),
                Delivery::Guaranteed,
            )
            .await;

        self.log_activity(ActivityLogEntry::new(
            actor,
            "chat_abandoned",
            Some(session_id),
            Some(reason),
        ));

        self.dispatch.nudge();
        stats::publish_queue_state_quiet(&self.sessions, &self.registry, &self.broker).await;

        Ok(record)
    }

    /// Post-chat rating; only legal on resolved sessions.
    pub async fn rate(
        &self,
        session_id: Uuid,
        rating: i32,
        feedback: Option<&str>,
    ) -> Result<ChatSession, Error> {
        if !(1..=5).contains(&rating) {
            return Err(Error::InvalidRating(rating));
        }
        let session = with_deadline(
            self.config.store_deadline,
            self.sessions.set_rating(session_id, rating, feedback),
        )
        .await?;
        self.log_activity(ActivityLogEntry::new(
            None,
            "chat_rated",
            Some(session_id),
            Some(&rating.to_string()),
        ));
        Ok(session)
    }

    /// Resolve a resume token into the session, its ordered transcript, and
    /// the assigned agent. Reconnection never changes status.
    pub async fn restore_by_token(
        &self,
        customer_token: &str,
    ) -> Result<(ChatSession, Vec<ChatMessage>, Option<User>), Error> {
        let session = self
            .sessions
            .get_by_token(customer_token)
            .await?
            .ok_or_else(|| Error::SessionNotFound("unknown customer token".to_string()))?;
        let transcript = self.messages.for_session(session.session_id).await?;
        let agent = match session.assigned_agent_id {
            Some(agent_id) => self.users.get(agent_id).await?,
            None => None,
        };
        Ok((session, transcript, agent))
    }

    /// Agent changes its own availability.
    pub async fn set_agent_state(
        &self,
        agent_id: Uuid,
        state: AgentState,
    ) -> Result<(), Error> {
        let row = with_deadline(
            self.config.store_deadline,
            self.presence
                .set_state(agent_id, state, self.config.max_chats_per_cs),
        )
        .await?;
        self.registry.apply(&row);

        info!(agent = %agent_id, state = state.as_str(), "agent state changed");

        if state == AgentState::Online {
            self.dispatch.nudge();
        }
        Ok(())
    }

    /// Socket closed for an agent: force offline. Capacity for in-flight
    /// chats is intentionally untouched; the chats stay assigned.
    pub async fn agent_disconnected(&self, agent_id: Uuid) {
        if let Err(e) = self.set_agent_state(agent_id, AgentState::Offline).await {
            warn!(agent = %agent_id, "failed to mark disconnected agent offline: {e}");
        }
    }

    /// Socket closed for a customer bound to an active session: the agent
    /// side gets a hint, but the session stays open for reconnection.
    pub async fn customer_disconnected(&self, session_id: Uuid) {
        if let Ok(Some(session)) = self.sessions.get(session_id).await {
            if session.status == SessionStatus::Active {
                self.broker
                    .publish(
                        &topics::session(session_id),
                        Envelope::new(
                            events::CHAT_CUSTOMER_LEFT,
                            json!({ "sessionId": session_id }),
                        ),
                        Delivery::BestEffort,
                    )
                    .await;
            }
        }
    }

    /// Audit the cached capacity counter against the session table and
    /// resync the mirror if they disagree.
    pub async fn audit_capacity(&self, agent_id: Uuid) -> Result<(), Error> {
        let counted = self.sessions.active_count_for_agent(agent_id).await?;
        if let Some(row) = self.presence.get(agent_id).await? {
            if i64::from(row.current_chats) != counted {
                warn!(
                    agent = %agent_id,
                    cached = row.current_chats,
                    counted,
                    "capacity counter diverged; resyncing mirror from store"
                );
            }
            self.registry.apply(&row);
        }
        Ok(())
    }

    /// Startup: load the mirror from the store.
    pub async fn rehydrate_registry(&self) -> Result<(), Error> {
        let rows = self.presence.all().await?;
        self.registry.rehydrate(rows);
        Ok(())
    }

    /// Shutdown: everyone goes offline, durably and in the mirror.
    pub async fn shutdown_flush(&self) -> Result<(), Error> {
        self.presence.set_all_offline().await?;
        self.registry.flush_offline();
        Ok(())
    }
}
