//! Postgres-backed repository tests. These exercise the real transaction
//! guards (assignment race, capacity cap, append-after-close) and need a
//! live database:
//!
//!   TEST_DATABASE_URL=postgres://livedesk@localhost/livedesk_test \
//!     cargo test -p livedesk-core --test repository_tests -- --ignored

use std::sync::Arc;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use livedesk_common::models::{
    AgentPresence, AgentState, ChatMessage, ChatSession, MessageKind, SessionStatus, StaffRole,
    User,
};
use livedesk_common::traits::{
    MessageRepository, PresenceRepository, SessionRepository, UserRepository,
};
use livedesk_common::Error;

use livedesk_core::repositories::postgres::{
    PostgresActivityLogRepository, PostgresCannedResponseRepository, PostgresMessageRepository,
    PostgresPresenceRepository, PostgresSessionRepository, PostgresUserRepository,
};

async fn test_pool() -> Result<Pool<Postgres>, Error> {
    let url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://livedesk@localhost/livedesk_test".to_string());
    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;

    // Fresh schema per run.
    sqlx::query("DROP SCHEMA public CASCADE; CREATE SCHEMA public;")
        .execute(&pool)
        .await?;
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Server(format!("migration failed: {e}")))?;

    Ok(pool)
}

async fn seed_agent(pool: &Pool<Postgres>, name: &str, max_chats: i32) -> Uuid {
    let users = PostgresUserRepository::new(pool.clone());
    let presence = PostgresPresenceRepository::new(pool.clone());
    let user = User {
        user_id: Uuid::new_v4(),
        username: name.to_string(),
        email: None,
        display_name: None,
        role: StaffRole::Cs,
        is_active: true,
        created_at: Utc::now(),
        last_login_at: None,
    };
    users.create(&user).await.unwrap();
    presence
        .upsert(&AgentPresence {
            user_id: user.user_id,
            state: AgentState::Online,
            current_chats: 0,
            max_chats,
            last_active_at: Utc::now(),
        })
        .await
        .unwrap();
    user.user_id
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn session_create_and_token_lookup() {
    let pool = test_pool().await.unwrap();
    let repo = PostgresSessionRepository::new(pool.clone());

    let session = ChatSession::new("tok-123".into(), Some("Ada".into()), None, None);
    repo.create(&session).await.unwrap();

    let by_token = repo.get_by_token("tok-123").await.unwrap().unwrap();
    assert_eq!(by_token.session_id, session.session_id);
    assert_eq!(by_token.status, SessionStatus::Waiting);
    assert!(by_token.assigned_agent_id.is_none());

    assert!(repo.get_by_token("nope").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn concurrent_assign_commits_exactly_once() {
    let pool = test_pool().await.unwrap();
    let repo = Arc::new(PostgresSessionRepository::new(pool.clone()));
    let a1 = seed_agent(&pool, "a1", 1).await;
    let a2 = seed_agent(&pool, "a2", 1).await;

    let session = ChatSession::new("race".into(), None, None, None);
    repo.create(&session).await.unwrap();
    let sid = session.session_id;

    let r1 = {
        let repo = repo.clone();
        tokio::spawn(async move { repo.assign(sid, a1, "a1 joined the chat").await })
    };
    let r2 = {
        let repo = repo.clone();
        tokio::spawn(async move { repo.assign(sid, a2, "a2 joined the chat").await })
    };
    let (r1, r2) = (r1.await.unwrap(), r2.await.unwrap());

    assert_eq!(
        [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one assignment transaction may commit"
    );
    let loser = if r1.is_ok() { r2 } else { r1 };
    assert!(matches!(loser, Err(Error::AlreadyAssigned(_))));

    let presence = PostgresPresenceRepository::new(pool.clone());
    let total: i32 = presence
        .all()
        .await
        .unwrap()
        .iter()
        .map(|p| p.current_chats)
        .sum();
    assert_eq!(total, 1);
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn capacity_cap_is_enforced_in_the_transaction() {
    let pool = test_pool().await.unwrap();
    let repo = PostgresSessionRepository::new(pool.clone());
    let agent = seed_agent(&pool, "solo", 1).await;

    let s1 = ChatSession::new("one".into(), None, None, None);
    let s2 = ChatSession::new("two".into(), None, None, None);
    repo.create(&s1).await.unwrap();
    repo.create(&s2).await.unwrap();

    repo.assign(s1.session_id, agent, "joined").await.unwrap();
    let overflow = repo.assign(s2.session_id, agent, "joined").await;
    assert!(matches!(overflow, Err(Error::AtCapacity(_))));

    // The refused claim must leave the session waiting.
    let still_waiting = repo.get(s2.session_id).await.unwrap().unwrap();
    assert_eq!(still_waiting.status, SessionStatus::Waiting);
    assert!(still_waiting.assigned_agent_id.is_none());
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn append_is_refused_after_resolve() {
    let pool = test_pool().await.unwrap();
    let sessions = PostgresSessionRepository::new(pool.clone());
    let messages = PostgresMessageRepository::new(pool.clone());
    let agent = seed_agent(&pool, "alice", 5).await;

    let session = ChatSession::new("closing".into(), None, None, None);
    sessions.create(&session).await.unwrap();
    let sid = session.session_id;

    sessions.assign(sid, agent, "joined").await.unwrap();
    messages
        .append(&ChatMessage::customer(sid, "hi".into(), MessageKind::Text))
        .await
        .unwrap();
    sessions.resolve(sid, agent, None, "Chat resolved").await.unwrap();

    let late = messages
        .append(&ChatMessage::customer(sid, "too late".into(), MessageKind::Text))
        .await;
    assert!(late.is_err());

    // Transcript order is (created_at, message_id).
    let transcript = messages.for_session(sid).await.unwrap();
    assert!(transcript.windows(2).all(|w| {
        (w[0].created_at, w[0].message_id) <= (w[1].created_at, w[1].message_id)
    }));
    let resolved_at = sessions.get(sid).await.unwrap().unwrap().resolved_at.unwrap();
    assert!(transcript.iter().all(|m| m.created_at <= resolved_at));
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn idle_candidates_honor_the_cutoff() {
    let pool = test_pool().await.unwrap();
    let sessions = PostgresSessionRepository::new(pool.clone());
    let messages = PostgresMessageRepository::new(pool.clone());

    let quiet = ChatSession::new("quiet".into(), None, None, None);
    sessions.create(&quiet).await.unwrap();

    // Cutoff after quiet's creation; chatty's activity lands after it.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let cutoff = Utc::now();

    let chatty = ChatSession::new("chatty".into(), None, None, None);
    sessions.create(&chatty).await.unwrap();
    messages
        .append(&ChatMessage::customer(chatty.session_id, "hello".into(), MessageKind::Text))
        .await
        .unwrap();

    let idle = sessions.idle_candidates(cutoff).await.unwrap();
    let ids: Vec<Uuid> = idle.iter().map(|s| s.session_id).collect();
    assert!(ids.contains(&quiet.session_id));
    assert!(!ids.contains(&chatty.session_id));
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn users_canned_and_activity_round_trip() {
    use livedesk_common::models::{ActivityLogEntry, CannedResponse};
    use livedesk_common::traits::{ActivityLogRepository, CannedResponseRepository};

    let pool = test_pool().await.unwrap();
    let users = PostgresUserRepository::new(pool.clone());
    let canned = PostgresCannedResponseRepository::new(pool.clone());
    let activity = PostgresActivityLogRepository::new(pool.clone());

    let agent_id = seed_agent(&pool, "jo", 5).await;
    let by_name = users.get_by_username("jo").await.unwrap().unwrap();
    assert_eq!(by_name.user_id, agent_id);
    assert_eq!(users.list_active().await.unwrap().len(), 1);

    let snippet = CannedResponse::new("Greeting".into(), "Hi, how can I help?".into(), Some(agent_id));
    canned.create(&snippet).await.unwrap();
    assert_eq!(canned.list_active().await.unwrap().len(), 1);
    canned.deactivate(snippet.canned_response_id).await.unwrap();
    assert!(canned.list_active().await.unwrap().is_empty());
    assert!(!canned
        .get(snippet.canned_response_id)
        .await
        .unwrap()
        .unwrap()
        .is_active);

    activity
        .insert(&ActivityLogEntry::new(Some(agent_id), "chat_assigned", None, None))
        .await
        .unwrap();
    let recent = activity.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].action, "chat_assigned");
}

#[tokio::test]
#[ignore = "requires postgres (TEST_DATABASE_URL)"]
async fn presence_set_state_creates_and_updates() {
    let pool = test_pool().await.unwrap();
    let users = PostgresUserRepository::new(pool.clone());
    let presence = PostgresPresenceRepository::new(pool.clone());

    let user = User {
        user_id: Uuid::new_v4(),
        username: "fresh".into(),
        email: None,
        display_name: None,
        role: StaffRole::Cs,
        is_active: true,
        created_at: Utc::now(),
        last_login_at: None,
    };
    users.create(&user).await.unwrap();

    let row = presence.set_state(user.user_id, AgentState::Online, 5).await.unwrap();
    assert_eq!(row.state, AgentState::Online);
    assert_eq!(row.current_chats, 0);
    assert_eq!(row.max_chats, 5);

    let row = presence.set_state(user.user_id, AgentState::Offline, 5).await.unwrap();
    assert_eq!(row.state, AgentState::Offline);

    presence.set_all_offline().await.unwrap();
    assert!(presence
        .all()
        .await
        .unwrap()
        .iter()
        .all(|p| p.state == AgentState::Offline));
}
