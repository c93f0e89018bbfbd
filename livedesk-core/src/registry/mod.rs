//! In-process mirror of agent presence and capacity.
//!
//! The store row is authoritative; this registry is the dispatcher's fast
//! view. Services overwrite entries with the committed row after every
//! capacity-changing transaction, and `resync` reloads wholesale when
//! divergence is suspected.

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use livedesk_common::models::{AgentPresence, AgentState};

const CHANGE_BUFFER: usize = 256;

/// Outcome of an in-memory capacity reservation.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved(AgentPresence),
    AtCapacity,
    NotOnline,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    agents: std::sync::Arc<DashMap<Uuid, AgentPresence>>,
    changes: broadcast::Sender<AgentPresence>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { agents: std::sync::Arc::new(DashMap::new()), changes }
    }

    /// Load the registry from store rows at startup.
    pub fn rehydrate(&self, rows: Vec<AgentPresence>) {
        self.agents.clear();
        for row in rows {
            self.agents.insert(row.user_id, row);
        }
    }

    /// Overwrite one entry with an authoritative store row.
    pub fn apply(&self, presence: &AgentPresence) {
        self.agents.insert(presence.user_id, presence.clone());
        let _ = self.changes.send(presence.clone());
    }

    pub fn get(&self, user_id: Uuid) -> Option<AgentPresence> {
        self.agents.get(&user_id).map(|e| e.clone())
    }

    /// Atomically take one slot of capacity iff the agent is available.
    pub fn reserve(&self, user_id: Uuid) -> ReserveOutcome {
        match self.agents.get_mut(&user_id) {
            Some(mut entry) => {
                if entry.state != AgentState::Online {
                    return ReserveOutcome::NotOnline;
                }
                if entry.current_chats >= entry.max_chats {
                    return ReserveOutcome::AtCapacity;
                }
                entry.current_chats += 1;
                entry.last_active_at = Utc::now();
                let snapshot = entry.clone();
                drop(entry);
                let _ = self.changes.send(snapshot.clone());
                ReserveOutcome::Reserved(snapshot)
            }
            None => ReserveOutcome::NotOnline,
        }
    }

    /// Give one slot back; never goes below zero.
    pub fn release(&self, user_id: Uuid) -> Option<AgentPresence> {
        let snapshot = {
            let mut entry = self.agents.get_mut(&user_id)?;
            if entry.current_chats > 0 {
                entry.current_chats -= 1;
            }
            entry.clone()
        };
        let _ = self.changes.send(snapshot.clone());
        Some(snapshot)
    }

    pub fn set_state(&self, user_id: Uuid, state: AgentState) -> Option<AgentPresence> {
        let snapshot = {
            let mut entry = self.agents.get_mut(&user_id)?;
            entry.state = state;
            entry.last_active_at = Utc::now();
            entry.clone()
        };
        let _ = self.changes.send(snapshot.clone());
        Some(snapshot)
    }

    pub fn snapshot(&self) -> Vec<AgentPresence> {
        let mut all: Vec<AgentPresence> = self.agents.iter().map(|e| e.clone()).collect();
        all.sort_by_key(|p| p.user_id);
        all
    }

    /// Available agents in assignment preference order: least loaded first,
    /// ties to the longest-idle.
    pub fn available(&self) -> Vec<AgentPresence> {
        let mut avail: Vec<AgentPresence> = self
            .agents
            .iter()
            .filter(|e| e.is_available())
            .map(|e| e.clone())
            .collect();
        avail.sort_by(|a, b| {
            a.current_chats
                .cmp(&b.current_chats)
                .then(a.last_active_at.cmp(&b.last_active_at))
                .then(a.user_id.cmp(&b.user_id))
        });
        avail
    }

    pub fn online_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|e| e.state != AgentState::Offline)
            .count()
    }

    /// Shutdown flush: force every agent offline in the mirror.
    pub fn flush_offline(&self) {
        for mut entry in self.agents.iter_mut() {
            entry.state = AgentState::Offline;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentPresence> {
        self.changes.subscribe()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
