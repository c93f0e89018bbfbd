//! In-memory implementations of the repository traits for tests.
//!
//! One mutex over the whole state gives the same atomicity the Postgres
//! transactions provide, so the service-level race and capacity semantics
//! can be exercised without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use livedesk_common::error::StoreOp;
use livedesk_common::models::{
    ActivityLogEntry, AgentPresence, AgentState, CannedResponse, ChatMessage, ChatSession,
    SessionStatus, StaffRole, User,
};
use livedesk_common::traits::{
    ActivityLogRepository, AssignmentRecord, CannedResponseRepository, ClosureRecord,
    MessageRepository, PresenceRepository, SessionRepository, TransferRecord, UserRepository,
};
use livedesk_common::Error;

#[derive(Default)]
struct StoreState {
    sessions: HashMap<Uuid, ChatSession>,
    messages: Vec<ChatMessage>,
    presence: HashMap<Uuid, AgentPresence>,
    users: HashMap<Uuid, User>,
    canned: HashMap<Uuid, CannedResponse>,
    activity: Vec<ActivityLogEntry>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a staff account with a presence row.
    pub fn add_agent(&self, name: &str, state: AgentState, max_chats: i32) -> Uuid {
        let user_id = Uuid::new_v4();
        let user = User {
            user_id,
            username: name.to_string(),
            email: None,
            display_name: None,
            role: StaffRole::Cs,
            is_active: true,
            created_at: Utc::now(),
            last_login_at: None,
        };
        let presence = AgentPresence {
            user_id,
            state,
            current_chats: 0,
            max_chats,
            last_active_at: Utc::now(),
        };
        let mut guard = self.state.lock().unwrap();
        guard.users.insert(user_id, user);
        guard.presence.insert(user_id, presence);
        user_id
    }

    /// Backdate a session's entire transcript so the idle reaper sees it
    /// as stale. Idleness is judged on the newest message, so every entry
    /// moves.
    pub fn age_last_message(&self, session_id: Uuid, to: DateTime<Utc>) {
        let mut guard = self.state.lock().unwrap();
        for msg in guard
            .messages
            .iter_mut()
            .filter(|m| m.session_id == session_id)
        {
            if msg.created_at > to {
                msg.created_at = to;
            }
        }
        if let Some(session) = guard.sessions.get_mut(&session_id) {
            if session.created_at > to {
                session.created_at = to;
            }
        }
    }

    pub fn presence_of(&self, user_id: Uuid) -> Option<AgentPresence> {
        self.state.lock().unwrap().presence.get(&user_id).cloned()
    }

    pub fn session_of(&self, session_id: Uuid) -> Option<ChatSession> {
        self.state.lock().unwrap().sessions.get(&session_id).cloned()
    }

    fn ordered_messages(state: &StoreState, session_id: Uuid) -> Vec<ChatMessage> {
        let mut msgs: Vec<ChatMessage> = state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        msgs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.message_id.cmp(&b.message_id))
        });
        msgs
    }
}

#[async_trait]
impl SessionRepository for InMemoryStore {
    async fn create(&self, session: &ChatSession) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        guard.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>, Error> {
        Ok(self.state.lock().unwrap().sessions.get(&session_id).cloned())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<ChatSession>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .values()
            .find(|s| s.customer_token == token)
            .cloned())
    }

    async fn waiting_ordered(&self) -> Result<Vec<ChatSession>, Error> {
        let guard = self.state.lock().unwrap();
        let mut waiting: Vec<ChatSession> = guard
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Waiting)
            .cloned()
            .collect();
        waiting.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.session_id.cmp(&b.session_id))
        });
        Ok(waiting)
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> Result<Vec<ChatSession>, Error> {
        let guard = self.state.lock().unwrap();
        let mut active: Vec<ChatSession> = guard
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Active && s.assigned_agent_id == Some(agent_id)
            })
            .cloned()
            .collect();
        active.sort_by_key(|s| s.assigned_at);
        Ok(active)
    }

    async fn active_count_for_agent(&self, agent_id: Uuid) -> Result<i64, Error> {
        Ok(self.active_for_agent(agent_id).await?.len() as i64)
    }

    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<ChatSession>, Error> {
        let guard = self.state.lock().unwrap();
        let mut closed: Vec<ChatSession> = guard
            .sessions
            .values()
            .filter(|s| s.is_terminal())
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        Ok(closed
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn assign(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        system_note: &str,
    ) -> Result<AssignmentRecord, Error> {
        let mut guard = self.state.lock().unwrap();

        match guard.sessions.get(&session_id) {
            None => return Err(Error::SessionNotFound(session_id.to_string())),
            Some(s) if s.status != SessionStatus::Waiting => {
                return Err(Error::AlreadyAssigned(session_id))
            }
            Some(_) => {}
        }
        match guard.presence.get(&agent_id) {
            None => return Err(Error::NotOnline(agent_id)),
            Some(p) if p.state != AgentState::Online => return Err(Error::NotOnline(agent_id)),
            Some(p) if p.current_chats >= p.max_chats => {
                return Err(Error::AtCapacity(agent_id))
            }
            Some(_) => {}
        }

        let now = Utc::now();
        let session = guard.sessions.get_mut(&session_id).unwrap();
        session.status = SessionStatus::Active;
        session.assigned_agent_id = Some(agent_id);
        session.assigned_at = Some(now);
        let session = session.clone();

        let presence = guard.presence.get_mut(&agent_id).unwrap();
        presence.current_chats += 1;
        presence.last_active_at = now;
        let agent = presence.clone();

        let system_message = ChatMessage::system(session_id, system_note);
        guard.messages.push(system_message.clone());

        Ok(AssignmentRecord { session, agent, system_message })
    }

    async fn transfer(
        &self,
        session_id: Uuid,
        from_agent: Uuid,
        to_agent: Uuid,
        system_note: &str,
    ) -> Result<TransferRecord, Error> {
        let mut guard = self.state.lock().unwrap();

        match guard.sessions.get(&session_id) {
            None => return Err(Error::SessionNotFound(session_id.to_string())),
            Some(s)
                if s.status != SessionStatus::Active
                    || s.assigned_agent_id != Some(from_agent) =>
            {
                return Err(Error::NotAssigned { agent_id: from_agent, session_id })
            }
            Some(_) => {}
        }
        match guard.presence.get(&to_agent) {
            None => return Err(Error::TargetNotOnline(to_agent)),
            Some(p) if p.state != AgentState::Online => {
                return Err(Error::TargetNotOnline(to_agent))
            }
            Some(p) if p.current_chats >= p.max_chats => {
                return Err(Error::TargetAtCapacity(to_agent))
            }
            Some(_) => {}
        }

        let now = Utc::now();
        let session = guard.sessions.get_mut(&session_id).unwrap();
        session.assigned_agent_id = Some(to_agent);
        session.assigned_at = Some(now);
        let session = session.clone();

        let target = guard.presence.get_mut(&to_agent).unwrap();
        target.current_chats += 1;
        target.last_active_at = now;
        let to = target.clone();

        let source = guard.presence.get_mut(&from_agent).unwrap();
        source.current_chats = (source.current_chats - 1).max(0);
        source.last_active_at = now;
        let from = source.clone();

        let system_message = ChatMessage::system(session_id, system_note);
        guard.messages.push(system_message.clone());

        Ok(TransferRecord { session, from_agent: from, to_agent: to, system_message })
    }

    async fn resolve(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        notes: Option<&str>,
        system_note: &str,
    ) -> Result<ClosureRecord, Error> {
        let mut guard = self.state.lock().unwrap();

        match guard.sessions.get(&session_id) {
            None => return Err(Error::SessionNotFound(session_id.to_string())),
            Some(s)
                if s.status != SessionStatus::Active
                    || s.assigned_agent_id != Some(agent_id) =>
            {
                return Err(Error::NotAssigned { agent_id, session_id })
            }
            Some(_) => {}
        }

        let system_message = ChatMessage::system(session_id, system_note);
        guard.messages.push(system_message.clone());

        let session = guard.sessions.get_mut(&session_id).unwrap();
        session.status = SessionStatus::Resolved;
        session.resolved_at = Some(Utc::now());
        session.resolve_notes = notes.map(String::from);
        let session = session.clone();

        let presence = guard.presence.get_mut(&agent_id).unwrap();
        presence.current_chats = (presence.current_chats - 1).max(0);
        let released = presence.clone();

        Ok(ClosureRecord { session, released: Some(released), system_message })
    }

    async fn abandon(&self, session_id: Uuid, system_note: &str) -> Result<ClosureRecord, Error> {
        let mut guard = self.state.lock().unwrap();

        let before = match guard.sessions.get(&session_id) {
            None => return Err(Error::SessionNotFound(session_id.to_string())),
            Some(s) if s.is_terminal() => {
                return Err(Error::SessionNotFound(session_id.to_string()))
            }
            Some(s) => s.clone(),
        };

        let system_message = ChatMessage::system(session_id, system_note);
        guard.messages.push(system_message.clone());

        let session = guard.sessions.get_mut(&session_id).unwrap();
        session.status = SessionStatus::Abandoned;
        session.resolved_at = Some(Utc::now());
        let session = session.clone();

        let released = match (before.status, before.assigned_agent_id) {
            (SessionStatus::Active, Some(agent_id)) => {
                let presence = guard.presence.get_mut(&agent_id).unwrap();
                presence.current_chats = (presence.current_chats - 1).max(0);
                Some(presence.clone())
            }
            _ => None,
        };

        Ok(ClosureRecord { session, released, system_message })
    }

    async fn set_rating(
        &self,
        session_id: Uuid,
        rating: i32,
        feedback: Option<&str>,
    ) -> Result<ChatSession, Error> {
        let mut guard = self.state.lock().unwrap();
        let session = guard
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Resolved {
            return Err(Error::store(StoreOp::Rating, "session is not resolved"));
        }
        session.rating = Some(rating);
        session.feedback = feedback.map(String::from);
        Ok(session.clone())
    }

    async fn idle_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChatSession>, Error> {
        let guard = self.state.lock().unwrap();
        let mut idle: Vec<ChatSession> = guard
            .sessions
            .values()
            .filter(|s| !s.is_terminal())
            .filter(|s| {
                let last = guard
                    .messages
                    .iter()
                    .filter(|m| m.session_id == s.session_id)
                    .map(|m| m.created_at)
                    .max()
                    .unwrap_or(s.created_at);
                last < cutoff
            })
            .cloned()
            .collect();
        idle.sort_by_key(|s| s.created_at);
        Ok(idle)
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        match guard.sessions.get(&message.session_id) {
            Some(s) if !s.is_terminal() => {
                guard.messages.push(message.clone());
                Ok(())
            }
            _ => Err(Error::store(StoreOp::Send, "session is closed or unknown")),
        }
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, Error> {
        let guard = self.state.lock().unwrap();
        Ok(Self::ordered_messages(&guard, session_id))
    }

    async fn last_activity(&self, session_id: Uuid) -> Result<Option<DateTime<Utc>>, Error> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.created_at)
            .max())
    }
}

#[async_trait]
impl PresenceRepository for InMemoryStore {
    async fn upsert(&self, presence: &AgentPresence) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .presence
            .insert(presence.user_id, presence.clone());
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<AgentPresence>, Error> {
        Ok(self.state.lock().unwrap().presence.get(&user_id).cloned())
    }

    async fn all(&self) -> Result<Vec<AgentPresence>, Error> {
        Ok(self.state.lock().unwrap().presence.values().cloned().collect())
    }

    async fn set_state(
        &self,
        user_id: Uuid,
        state: AgentState,
        max_chats_default: i32,
    ) -> Result<AgentPresence, Error> {
        let mut guard = self.state.lock().unwrap();
        let entry = guard
            .presence
            .entry(user_id)
            .or_insert_with(|| AgentPresence::offline(user_id, max_chats_default));
        entry.state = state;
        entry.last_active_at = Utc::now();
        Ok(entry.clone())
    }

    async fn set_all_offline(&self) -> Result<(), Error> {
        for presence in self.state.lock().unwrap().presence.values_mut() {
            presence.state = AgentState::Offline;
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn create(&self, user: &User) -> Result<(), Error> {
        self.state.lock().unwrap().users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<User>, Error> {
        Ok(self.state.lock().unwrap().users.get(&user_id).cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<User>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .values()
            .filter(|u| u.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CannedResponseRepository for InMemoryStore {
    async fn create(&self, canned: &CannedResponse) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .canned
            .insert(canned.canned_response_id, canned.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CannedResponse>, Error> {
        Ok(self.state.lock().unwrap().canned.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<CannedResponse>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .canned
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), Error> {
        if let Some(c) = self.state.lock().unwrap().canned.get_mut(&id) {
            c.is_active = false;
        }
        Ok(())
    }
}

/// Full service stack over an in-memory store, for integration tests.
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub registry: Arc<crate::registry::PresenceRegistry>,
    pub broker: crate::broker::Broker,
    pub dispatch: crate::services::DispatchHandle,
    pub sessions: Arc<crate::services::SessionService>,
    pub messages: Arc<crate::services::MessageService>,
}

pub fn harness(config: crate::config::CoreConfig) -> TestHarness {
    let store = InMemoryStore::new();
    let registry = Arc::new(crate::registry::PresenceRegistry::new());
    let broker = crate::broker::Broker::new();
    let dispatch = crate::services::DispatchHandle::new();

    let sessions = Arc::new(crate::services::SessionService::new(
        store.clone() as Arc<dyn SessionRepository>,
        store.clone() as Arc<dyn MessageRepository>,
        store.clone() as Arc<dyn PresenceRepository>,
        store.clone() as Arc<dyn UserRepository>,
        store.clone() as Arc<dyn ActivityLogRepository>,
        registry.clone(),
        broker.clone(),
        dispatch.clone(),
        config.clone(),
    ));
    let messages = Arc::new(crate::services::MessageService::new(
        store.clone() as Arc<dyn SessionRepository>,
        store.clone() as Arc<dyn MessageRepository>,
        broker.clone(),
        config,
    ));

    TestHarness { store, registry, broker, dispatch, sessions, messages }
}

impl TestHarness {
    /// Seed an online agent and load it into the capacity mirror.
    pub async fn online_agent(&self, name: &str, max_chats: i32) -> Uuid {
        let id = self.store.add_agent(name, AgentState::Online, max_chats);
        self.sessions.rehydrate_registry().await.unwrap();
        id
    }

    /// Seed an agent in an arbitrary state.
    pub async fn agent_in_state(&self, name: &str, state: AgentState, max_chats: i32) -> Uuid {
        let id = self.store.add_agent(name, state, max_chats);
        self.sessions.rehydrate_registry().await.unwrap();
        id
    }
}

#[async_trait]
impl ActivityLogRepository for InMemoryStore {
    async fn insert(&self, entry: &ActivityLogEntry) -> Result<(), Error> {
        self.state.lock().unwrap().activity.push(entry.clone());
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<ActivityLogEntry>, Error> {
        let guard = self.state.lock().unwrap();
        let mut entries: Vec<ActivityLogEntry> = guard.activity.clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit as usize);
        Ok(entries)
    }
}
