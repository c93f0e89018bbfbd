//! End-to-end scenarios for the routing engine over the in-memory store:
//! happy path, queueing, accept races, transfer, idle abandonment, and
//! reconnect replay.

use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use livedesk_common::models::{AgentState, SenderType, SessionStatus};
use livedesk_common::Error;

use livedesk_core::broker::{events, topics, Envelope};
use livedesk_core::config::CoreConfig;
use livedesk_core::services::{Placement, Dispatcher};
use livedesk_core::test_utils::{harness, TestHarness};

async fn recv_event(
    rx: &mut tokio::sync::mpsc::Receiver<Envelope>,
    event: &str,
) -> Option<Envelope> {
    // Skip unrelated frames (queue updates, stats) until the wanted event.
    loop {
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(env)) if env.event == event => return Some(env),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

fn test_config() -> CoreConfig {
    CoreConfig::default()
}

/// S1: one free agent, customer starts a chat, assignment is immediate.
#[tokio::test]
async fn happy_path_assigns_immediately() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    // Agent connection subscribed the way the gateway does it.
    let agent_conn = Uuid::new_v4();
    let mut agent_rx = h.broker.register(agent_conn);
    h.broker.subscribe(agent_conn, &topics::agent(agent_id));
    h.broker.subscribe(agent_conn, topics::QUEUE);

    // Customer flow: create, subscribe, then place.
    let session = h
        .sessions
        .create_session(Some("Ada".into()), None, None)
        .await
        .unwrap();
    let customer_conn = Uuid::new_v4();
    let mut customer_rx = h.broker.register(customer_conn);
    h.broker
        .subscribe(customer_conn, &topics::session(session.session_id));

    let placement = h.sessions.place_or_position(session.session_id).await.unwrap();
    match placement {
        Placement::Assigned { record, .. } => {
            assert_eq!(record.session.status, SessionStatus::Active);
            assert_eq!(record.session.assigned_agent_id, Some(agent_id));
            assert_eq!(record.agent.current_chats, 1);
        }
        Placement::Queued { .. } => panic!("expected immediate assignment"),
    }

    let assigned = recv_event(&mut customer_rx, events::CHAT_ASSIGNED).await.unwrap();
    assert_eq!(assigned.data["cs"]["id"], serde_json::json!(agent_id));

    let new_assigned = recv_event(&mut agent_rx, events::CHAT_NEW_ASSIGNED).await.unwrap();
    assert_eq!(
        new_assigned.data["sessionId"],
        serde_json::json!(session.session_id)
    );

    let stored = h.store.session_of(session.session_id).unwrap();
    assert_eq!(stored.status, SessionStatus::Active);
    assert!(stored.assigned_at.is_some());
}

/// S2: the only agent is busy; the session queues at position 1 and is
/// placed once the agent comes online.
#[tokio::test]
async fn queueing_until_agent_comes_online() {
    let h = harness(test_config());
    let agent_id = h.agent_in_state("bob", AgentState::Busy, 5).await;

    let queue_conn = Uuid::new_v4();
    let mut queue_rx = h.broker.register(queue_conn);
    h.broker.subscribe(queue_conn, topics::QUEUE);

    let session = h
        .sessions
        .create_session(Some("Ada".into()), None, None)
        .await
        .unwrap();
    let customer_conn = Uuid::new_v4();
    let mut customer_rx = h.broker.register(customer_conn);
    h.broker
        .subscribe(customer_conn, &topics::session(session.session_id));

    assert!(recv_event(&mut queue_rx, events::QUEUE_NEW_CHAT).await.is_some());

    match h.sessions.place_or_position(session.session_id).await.unwrap() {
        Placement::Queued { position } => assert_eq!(position, 1),
        Placement::Assigned { .. } => panic!("no agent should be available"),
    }

    // Agent frees up; the dispatcher drains the queue.
    h.sessions
        .set_agent_state(agent_id, AgentState::Online)
        .await
        .unwrap();
    let dispatcher = Dispatcher::new(h.sessions.clone(), h.dispatch.clone());
    dispatcher.drain().await;

    let assigned = recv_event(&mut customer_rx, events::CHAT_ASSIGNED).await.unwrap();
    assert_eq!(assigned.data["cs"]["id"], serde_json::json!(agent_id));
    assert_eq!(
        h.store.session_of(session.session_id).unwrap().status,
        SessionStatus::Active
    );
}

/// S3: two agents race to accept the same waiting chat; exactly one wins
/// and the loser's capacity is untouched.
#[tokio::test]
async fn accept_race_has_exactly_one_winner() {
    let h = harness(test_config());
    let a1 = h.online_agent("a1", 1).await;
    let a2 = h.online_agent("a2", 1).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;

    let (r1, r2) = tokio::join!(
        h.sessions.accept_chat(a1, sid),
        h.sessions.accept_chat(a2, sid),
    );

    let winners = [r1.is_ok(), r2.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1, "exactly one accept must commit");

    let (winner, loser, loser_result) = if r1.is_ok() { (a1, a2, r2) } else { (a2, a1, r1) };
    assert!(matches!(loser_result, Err(Error::AlreadyAssigned(_))));

    assert_eq!(h.store.presence_of(winner).unwrap().current_chats, 1);
    assert_eq!(h.store.presence_of(loser).unwrap().current_chats, 0);
    assert_eq!(h.registry.get(loser).unwrap().current_chats, 0);
    assert_eq!(
        h.store.session_of(sid).unwrap().assigned_agent_id,
        Some(winner)
    );
}

/// S4: transfer moves the session, both capacity counters, and notifies
/// all three parties.
#[tokio::test]
async fn transfer_moves_session_and_capacity() {
    let h = harness(test_config());
    let a1 = h.online_agent("a1", 5).await;
    let a2 = h.online_agent("a2", 5).await;

    let a1_conn = Uuid::new_v4();
    let mut a1_rx = h.broker.register(a1_conn);
    h.broker.subscribe(a1_conn, &topics::agent(a1));
    let a2_conn = Uuid::new_v4();
    let mut a2_rx = h.broker.register(a2_conn);
    h.broker.subscribe(a2_conn, &topics::agent(a2));

    let session = h.sessions.create_session(Some("Ada".into()), None, None).await.unwrap();
    let sid = session.session_id;
    let customer_conn = Uuid::new_v4();
    let mut customer_rx = h.broker.register(customer_conn);
    h.broker.subscribe(customer_conn, &topics::session(sid));

    h.sessions.accept_chat(a1, sid).await.unwrap();
    h.sessions.transfer_chat(a1, sid, a2).await.unwrap();

    assert_eq!(h.store.presence_of(a1).unwrap().current_chats, 0);
    assert_eq!(h.store.presence_of(a2).unwrap().current_chats, 1);
    assert_eq!(h.store.session_of(sid).unwrap().assigned_agent_id, Some(a2));
    assert_eq!(h.store.session_of(sid).unwrap().status, SessionStatus::Active);

    let transferred = recv_event(&mut customer_rx, events::CHAT_TRANSFERRED).await.unwrap();
    assert_eq!(transferred.data["newCs"]["id"], serde_json::json!(a2));
    assert!(recv_event(&mut a1_rx, events::CHAT_TRANSFERRED_OUT).await.is_some());
    assert!(recv_event(&mut a2_rx, events::CHAT_TRANSFERRED_IN).await.is_some());

    // The transcript records the hand-off.
    let transcript = messages_for(&h, sid).await;
    assert!(transcript
        .iter()
        .any(|m| m.sender_type == SenderType::System && m.content.contains("transferred to")));
}

/// Transfer to an unavailable target fails and the source keeps the chat.
#[tokio::test]
async fn transfer_to_unavailable_target_is_refused() {
    let h = harness(test_config());
    let a1 = h.online_agent("a1", 5).await;
    let busy = h.agent_in_state("busy", AgentState::Busy, 5).await;
    let full = h.online_agent("full", 1).await;

    let blocker = h.sessions.create_session(None, None, None).await.unwrap();
    h.sessions.accept_chat(full, blocker.session_id).await.unwrap();

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;
    h.sessions.accept_chat(a1, sid).await.unwrap();

    let to_busy = h.sessions.transfer_chat(a1, sid, busy).await;
    assert!(matches!(to_busy, Err(Error::TargetNotOnline(_))));

    let to_full = h.sessions.transfer_chat(a1, sid, full).await;
    assert!(matches!(to_full, Err(Error::TargetAtCapacity(_))));

    assert_eq!(h.store.session_of(sid).unwrap().assigned_agent_id, Some(a1));
    assert_eq!(h.store.presence_of(a1).unwrap().current_chats, 1);
}

/// S6: reconnect replays the full ordered transcript without changing
/// status.
#[tokio::test]
async fn reconnect_replays_ordered_transcript() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    let outcome = h
        .sessions
        .start_chat(Some("Ada".into()), Some("ada@example.com".into()), None)
        .await
        .unwrap();
    let sid = outcome.session.session_id;
    assert_eq!(outcome.session.assigned_agent_id, Some(agent_id));

    h.messages
        .send_customer_message(sid, "hello?", livedesk_common::models::MessageKind::Text)
        .await
        .unwrap();
    h.messages
        .send_agent_message(agent_id, sid, "hi Ada", livedesk_common::models::MessageKind::Text)
        .await
        .unwrap();

    let (restored, transcript, assigned) = h
        .sessions
        .restore_by_token(&outcome.session.customer_token)
        .await
        .unwrap();

    assert_eq!(restored.session_id, sid);
    assert_eq!(restored.status, SessionStatus::Active);
    assert_eq!(restored.customer_name.as_deref(), Some("Ada"));
    assert_eq!(assigned.unwrap().user_id, agent_id);

    // Welcome + join + two chat messages, in append order.
    assert!(transcript.len() >= 4);
    assert!(transcript.windows(2).all(|w| {
        (w[0].created_at, w[0].message_id) <= (w[1].created_at, w[1].message_id)
    }));
    let texts: Vec<&str> = transcript.iter().map(|m| m.content.as_str()).collect();
    let hello = texts.iter().position(|t| *t == "hello?").unwrap();
    let hi = texts.iter().position(|t| *t == "hi Ada").unwrap();
    assert!(hello < hi);
}

/// Unknown resume token is SESSION_NOT_FOUND.
#[tokio::test]
async fn restore_with_unknown_token_fails() {
    let h = harness(test_config());
    let res = h.sessions.restore_by_token("no-such-token").await;
    assert!(matches!(res, Err(Error::SessionNotFound(_))));
}

/// start_chat round trip: token resolves to the same customer fields and
/// only the welcome entry.
#[tokio::test]
async fn start_chat_round_trip() {
    let h = harness(test_config());

    let outcome = h
        .sessions
        .start_chat(Some("Ada".into()), Some("ada@example.com".into()), Some("https://x".into()))
        .await
        .unwrap();

    let (session, transcript, _) = h
        .sessions
        .restore_by_token(&outcome.session.customer_token)
        .await
        .unwrap();
    assert_eq!(session.customer_name.as_deref(), Some("Ada"));
    assert_eq!(session.customer_email.as_deref(), Some("ada@example.com"));
    assert_eq!(session.status, SessionStatus::Waiting);
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].sender_type, SenderType::System);
}

/// Duplicate resolve yields NOT_ASSIGNED and an unchanged session.
#[tokio::test]
async fn duplicate_resolve_is_rejected() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;
    h.sessions.accept_chat(agent_id, sid).await.unwrap();

    h.sessions.resolve_chat(agent_id, sid, Some("done")).await.unwrap();
    let after_first = h.store.session_of(sid).unwrap();
    assert_eq!(after_first.status, SessionStatus::Resolved);
    assert!(after_first.resolved_at.is_some());

    let second = h.sessions.resolve_chat(agent_id, sid, None).await;
    assert!(matches!(second, Err(Error::NotAssigned { .. })));

    let after_second = h.store.session_of(sid).unwrap();
    assert_eq!(after_second.resolved_at, after_first.resolved_at);
    assert_eq!(h.store.presence_of(agent_id).unwrap().current_chats, 0);
}

/// Boundary: the N+1-th accept fails with AT_CAPACITY and leaves capacity
/// unchanged.
#[tokio::test]
async fn accept_beyond_capacity_fails() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 2).await;

    for _ in 0..2 {
        let s = h.sessions.create_session(None, None, None).await.unwrap();
        h.sessions.accept_chat(agent_id, s.session_id).await.unwrap();
    }
    let extra = h.sessions.create_session(None, None, None).await.unwrap();
    let res = h.sessions.accept_chat(agent_id, extra.session_id).await;
    assert!(matches!(res, Err(Error::AtCapacity(_))));

    assert_eq!(h.store.presence_of(agent_id).unwrap().current_chats, 2);
    assert_eq!(
        h.store.session_of(extra.session_id).unwrap().status,
        SessionStatus::Waiting
    );
}

/// Boundary: going offline preserves active assignments.
#[tokio::test]
async fn offline_agent_keeps_assignments() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    h.sessions.accept_chat(agent_id, session.session_id).await.unwrap();

    h.sessions
        .set_agent_state(agent_id, AgentState::Offline)
        .await
        .unwrap();

    let stored = h.store.session_of(session.session_id).unwrap();
    assert_eq!(stored.status, SessionStatus::Active);
    assert_eq!(stored.assigned_agent_id, Some(agent_id));
    assert_eq!(h.store.presence_of(agent_id).unwrap().current_chats, 1);
}

/// Rating is only legal on resolved sessions and must be in 1..=5.
#[tokio::test]
async fn rating_rules() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;

    let too_big = h.sessions.rate(sid, 6, None).await;
    assert!(matches!(too_big, Err(Error::InvalidRating(6))));

    let not_resolved = h.sessions.rate(sid, 4, None).await;
    assert!(matches!(not_resolved, Err(Error::StoreFailed { .. })));

    h.sessions.accept_chat(agent_id, sid).await.unwrap();
    h.sessions.resolve_chat(agent_id, sid, None).await.unwrap();

    let rated = h.sessions.rate(sid, 4, Some("great")).await.unwrap();
    assert_eq!(rated.rating, Some(4));
    assert_eq!(rated.feedback.as_deref(), Some("great"));
}

/// Customer end releases capacity and closes the session; a second end is
/// rejected.
#[tokio::test]
async fn customer_end_chat_releases_capacity() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;
    h.sessions.accept_chat(agent_id, sid).await.unwrap();

    let record = h.sessions.end_chat(sid).await.unwrap();
    assert_eq!(record.session.status, SessionStatus::Abandoned);
    assert!(record.session.resolved_at.is_some());
    assert_eq!(record.released.unwrap().current_chats, 0);

    let again = h.sessions.end_chat(sid).await;
    assert!(matches!(again, Err(Error::SessionNotFound(_))));
}

/// Messages cannot land on a terminal session.
#[tokio::test]
async fn no_message_after_close() {
    let h = harness(test_config());
    let agent_id = h.online_agent("alice", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;
    h.sessions.accept_chat(agent_id, sid).await.unwrap();
    h.sessions.resolve_chat(agent_id, sid, None).await.unwrap();

    let customer = h
        .messages
        .send_customer_message(sid, "too late", livedesk_common::models::MessageKind::Text)
        .await;
    assert!(customer.is_err());

    let agent = h
        .messages
        .send_agent_message(agent_id, sid, "too late", livedesk_common::models::MessageKind::Text)
        .await;
    assert!(matches!(agent, Err(Error::NotAssigned { .. })));
}

/// Customer messages are accepted while waiting (before any agent joins).
#[tokio::test]
async fn customer_can_message_while_waiting() {
    let h = harness(test_config());
    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;

    let msg = h
        .messages
        .send_customer_message(sid, "anyone there?", livedesk_common::models::MessageKind::Text)
        .await
        .unwrap();
    assert_eq!(msg.sender_type, SenderType::Customer);
    assert!(msg.sender_id.is_none());

    let transcript = messages_for(&h, sid).await;
    assert_eq!(transcript.last().unwrap().content, "anyone there?");
}

/// An agent that is not the owner cannot write into the chat.
#[tokio::test]
async fn non_owner_agent_cannot_message() {
    let h = harness(test_config());
    let owner = h.online_agent("owner", 5).await;
    let other = h.online_agent("other", 5).await;

    let session = h.sessions.create_session(None, None, None).await.unwrap();
    let sid = session.session_id;
    h.sessions.accept_chat(owner, sid).await.unwrap();

    let res = h
        .messages
        .send_agent_message(other, sid, "mine now", livedesk_common::models::MessageKind::Text)
        .await;
    assert!(matches!(res, Err(Error::NotAssigned { .. })));
}

/// Empty content is rejected before touching the store.
#[tokio::test]
async fn empty_message_is_rejected() {
    let h = harness(test_config());
    let session = h.sessions.create_session(None, None, None).await.unwrap();

    let res = h
        .messages
        .send_customer_message(
            session.session_id,
            "   ",
            livedesk_common::models::MessageKind::Text,
        )
        .await;
    assert!(matches!(res, Err(Error::EmptyMessage)));
}

async fn messages_for(h: &TestHarness, sid: Uuid) -> Vec<livedesk_common::models::ChatMessage> {
    use livedesk_common::traits::MessageRepository;
    h.store.for_session(sid).await.unwrap()
}
