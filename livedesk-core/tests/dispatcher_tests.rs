//! Dispatcher policy tests: FIFO queue order, least-loaded selection with
//! idle tie-break, the auto-assign switch, and the idle reaper.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::timeout;
use uuid::Uuid;

use livedesk_common::models::{AgentPresence, AgentState, SenderType, SessionStatus};
use livedesk_common::traits::PresenceRepository;

use livedesk_core::broker::{events, topics, Envelope};
use livedesk_core::config::CoreConfig;
use livedesk_core::services::{Dispatcher, Placement};
use livedesk_core::tasks::idle_reaper::reap_idle_sessions;
use livedesk_core::test_utils::harness;

#[tokio::test]
async fn queue_is_drained_in_fifo_order() {
    // One slot only: the head of the queue must win it.
    let h = harness(CoreConfig::default());
    let agent = h.online_agent("solo", 1).await;
    let first = h.sessions.create_session(Some("first".into()), None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.sessions.create_session(Some("second".into()), None, None).await.unwrap();

    let dispatcher = Dispatcher::new(h.sessions.clone(), h.dispatch.clone());
    dispatcher.drain().await;

    let s1 = h.store.session_of(first.session_id).unwrap();
    let s2 = h.store.session_of(second.session_id).unwrap();
    assert_eq!(s1.status, SessionStatus::Active);
    assert_eq!(s1.assigned_agent_id, Some(agent));
    assert_eq!(s2.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn least_loaded_agent_gets_the_chat() {
    let h = harness(CoreConfig::default());
    let busy_one = h.online_agent("busy-one", 5).await;
    let idle_one = h.online_agent("idle-one", 5).await;

    // Load the first agent with one chat.
    let filler = h.sessions.create_session(None, None, None).await.unwrap();
    h.sessions.accept_chat(busy_one, filler.session_id).await.unwrap();

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    match h.sessions.place_or_position(session.session_id).await.unwrap() {
        Placement::Assigned { record, .. } => {
            assert_eq!(record.agent.user_id, idle_one);
        }
        Placement::Queued { .. } => panic!("an agent was available"),
    }
}

#[tokio::test]
async fn load_ties_break_to_longest_idle_agent() {
    let h = harness(CoreConfig::default());
    let recent = h.online_agent("recent", 5).await;
    let stale = h.online_agent("stale", 5).await;

    // Same load; make one agent idle for longer, then reload the mirror.
    let now = Utc::now();
    h.store
        .upsert(&AgentPresence {
            user_id: recent,
            state: AgentState::Online,
            current_chats: 0,
            max_chats: 5,
            last_active_at: now,
        })
        .await
        .unwrap();
    h.store
        .upsert(&AgentPresence {
            user_id: stale,
            state: AgentState::Online,
            current_chats: 0,
            max_chats: 5,
            last_active_at: now - ChronoDuration::minutes(30),
        })
        .await
        .unwrap();
    h.sessions.rehydrate_registry().await.unwrap();

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    match h.sessions.place_or_position(session.session_id).await.unwrap() {
        Placement::Assigned { record, .. } => assert_eq!(record.agent.user_id, stale),
        Placement::Queued { .. } => panic!("an agent was available"),
    }
}

#[tokio::test]
async fn disabled_auto_assign_leaves_queue_untouched() {
    let h = harness(CoreConfig { auto_assign_enabled: false, ..CoreConfig::default() });
    let _agent = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    match h.sessions.place_or_position(session.session_id).await.unwrap() {
        Placement::Queued { position } => assert_eq!(position, 1),
        Placement::Assigned { .. } => panic!("auto-assign is off"),
    }

    let dispatcher = Dispatcher::new(h.sessions.clone(), h.dispatch.clone());
    dispatcher.drain().await;
    assert_eq!(
        h.store.session_of(session.session_id).unwrap().status,
        SessionStatus::Waiting
    );

    // Manual accept still works with auto-assign off.
    let agent = h.online_agent("manual", 5).await;
    h.sessions.accept_chat(agent, session.session_id).await.unwrap();
    assert_eq!(
        h.store.session_of(session.session_id).unwrap().status,
        SessionStatus::Active
    );
}

/// S5: idle sessions are abandoned, capacity released, and the customer
/// side told why.
#[tokio::test]
async fn reaper_abandons_idle_active_session() {
    let h = harness(CoreConfig::default());
    let agent = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(Some("Ada".into()), None, None).await.unwrap();
    let sid = session.session_id;
    h.sessions.accept_chat(agent, sid).await.unwrap();

    let customer_conn = Uuid::new_v4();
    let mut customer_rx = h.broker.register(customer_conn);
    h.broker.subscribe(customer_conn, &topics::session(sid));

    // Last activity far beyond the 1800 s default.
    h.store.age_last_message(sid, Utc::now() - ChronoDuration::hours(2));

    let reaped = reap_idle_sessions(&h.sessions).await.unwrap();
    assert_eq!(reaped, 1);

    let stored = h.store.session_of(sid).unwrap();
    assert_eq!(stored.status, SessionStatus::Abandoned);
    assert!(stored.resolved_at.is_some());
    assert_eq!(h.store.presence_of(agent).unwrap().current_chats, 0);

    let ended = recv_event(&mut customer_rx, events::CHAT_ENDED).await.unwrap();
    assert_eq!(ended.data["reason"], serde_json::json!("idle"));

    use livedesk_common::traits::MessageRepository;
    let transcript = h.store.for_session(sid).await.unwrap();
    assert!(transcript
        .iter()
        .any(|m| m.sender_type == SenderType::System && m.content.contains("inactivity")));
}

#[tokio::test]
async fn reaper_spares_recently_active_sessions() {
    let h = harness(CoreConfig::default());
    let agent = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    h.sessions.accept_chat(agent, session.session_id).await.unwrap();
    h.messages
        .send_customer_message(
            session.session_id,
            "still here",
            livedesk_common::models::MessageKind::Text,
        )
        .await
        .unwrap();

    let reaped = reap_idle_sessions(&h.sessions).await.unwrap();
    assert_eq!(reaped, 0);
    assert_eq!(
        h.store.session_of(session.session_id).unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn reaper_abandons_idle_waiting_session_without_release() {
    let h = harness(CoreConfig::default());

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    h.store
        .age_last_message(session.session_id, Utc::now() - ChronoDuration::hours(1));

    let reaped = reap_idle_sessions(&h.sessions).await.unwrap();
    assert_eq!(reaped, 1);
    let stored = h.store.session_of(session.session_id).unwrap();
    assert_eq!(stored.status, SessionStatus::Abandoned);
    assert!(stored.assigned_agent_id.is_none());
}

async fn recv_event(
    rx: &mut tokio::sync::mpsc::Receiver<Envelope>,
    event: &str,
) -> Option<Envelope> {
    loop {
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(env)) if env.event == event => return Some(env),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}
