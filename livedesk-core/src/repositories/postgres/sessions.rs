use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use livedesk_common::models::{AgentState, ChatMessage, ChatSession, SessionStatus};
use livedesk_common::traits::{
    AssignmentRecord, ClosureRecord, SessionRepository, TransferRecord,
};
use livedesk_common::Error;

use super::messages::insert_message;
use super::presence::presence_from_row;

const SESSION_COLUMNS: &str = r#"
    session_id, customer_token, customer_name, customer_email, source_url,
    status, assigned_agent_id, created_at, assigned_at, resolved_at,
    resolve_notes, rating, feedback
"#;

pub(crate) fn session_from_row(r: &PgRow) -> Result<ChatSession, Error> {
    let status_str: String = r.try_get("status")?;
    Ok(ChatSession {
        session_id: r.try_get("session_id")?,
        customer_token: r.try_get("customer_token")?,
        customer_name: r.try_get("customer_name")?,
        customer_email: r.try_get("customer_email")?,
        source_url: r.try_get("source_url")?,
        status: SessionStatus::from_str(&status_str)?,
        assigned_agent_id: r.try_get("assigned_agent_id")?,
        created_at: r.try_get("created_at")?,
        assigned_at: r.try_get("assigned_at")?,
        resolved_at: r.try_get("resolved_at")?,
        resolve_notes: r.try_get("resolve_notes")?,
        rating: r.try_get("rating")?,
        feedback: r.try_get("feedback")?,
    })
}

pub struct PostgresSessionRepository {
    pool: Pool<Postgres>,
}

impl PostgresSessionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn fetch_session_tx(
        conn: &mut sqlx::PgConnection,
        session_id: Uuid,
    ) -> Result<ChatSession, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_one(&mut *conn)
        .await?;
        session_from_row(&row)
    }

    async fn fetch_presence_tx(
        conn: &mut sqlx::PgConnection,
        user_id: Uuid,
    ) -> Result<livedesk_common::models::AgentPresence, Error> {
        let row = sqlx::query(
            "SELECT user_id, state, current_chats, max_chats, last_active_at
             FROM agent_presence WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;
        presence_from_row(&row)
    }

    /// Explain why a presence reserve found no row to update.
    async fn classify_reserve_failure(
        &self,
        agent_id: Uuid,
        target: bool,
    ) -> Result<Error, Error> {
        let row = sqlx::query("SELECT state FROM agent_presence WHERE user_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        let err = match row {
            Some(r) => {
                let state: String = r.try_get("state")?;
                if AgentState::from_str(&state)? == AgentState::Online {
                    if target {
                        Error::TargetAtCapacity(agent_id)
                    } else {
                        Error::AtCapacity(agent_id)
                    }
                } else if target {
                    Error::TargetNotOnline(agent_id)
                } else {
                    Error::NotOnline(agent_id)
                }
            }
            None => {
                if target {
                    Error::TargetNotOnline(agent_id)
                } else {
                    Error::NotOnline(agent_id)
                }
            }
        };
        Ok(err)
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn create(&self, session: &ChatSession) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (
                session_id, customer_token, customer_name, customer_email,
                source_url, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.session_id)
        .bind(&session.customer_token)
        .bind(&session.customer_name)
        .bind(&session.customer_email)
        .bind(&session.source_url)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<ChatSession>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE customer_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn waiting_ordered(&self) -> Result<Vec<ChatSession>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions
             WHERE status = 'waiting'
             ORDER BY created_at, session_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> Result<Vec<ChatSession>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions
             WHERE status = 'active' AND assigned_agent_id = $1
             ORDER BY assigned_at"
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn active_count_for_agent(&self, agent_id: Uuid) -> Result<i64, Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM chat_sessions
             WHERE status = 'active' AND assigned_agent_id = $1",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<ChatSession>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions
             WHERE status IN ('resolved', 'abandoned')
             ORDER BY resolved_at DESC
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn assign(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        system_note: &str,
    ) -> Result<AssignmentRecord, Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Claim the session. A racing claim that committed first leaves
        // nothing waiting, so rows_affected tells us who won.
        let claimed = sqlx::query(
            "UPDATE chat_sessions
             SET status = 'active', assigned_agent_id = $2, assigned_at = $3
             WHERE session_id = $1 AND status = 'waiting'",
        )
        .bind(session_id)
        .bind(agent_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get(session_id).await? {
                None => Err(Error::SessionNotFound(session_id.to_string())),
                Some(_) => Err(Error::AlreadyAssigned(session_id)),
            };
        }

        // Reserve capacity; the WHERE clause enforces the cap.
        let reserved = sqlx::query(
            "UPDATE agent_presence
             SET current_chats = current_chats + 1, last_active_at = $2
             WHERE user_id = $1 AND state = 'online' AND current_chats < max_chats",
        )
        .bind(agent_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.classify_reserve_failure(agent_id, false).await?);
        }

        let system_message = ChatMessage::system(session_id, system_note);
        insert_message(&mut tx, &system_message).await?;

        let session = Self::fetch_session_tx(&mut *tx, session_id).await?;
        let agent = Self::fetch_presence_tx(&mut *tx, agent_id).await?;
        tx.commit().await?;

        Ok(AssignmentRecord { session, agent, system_message })
    }

    async fn transfer(
        &self,
        session_id: Uuid,
        from_agent: Uuid,
        to_agent: Uuid,
        system_note: &str,
    ) -> Result<TransferRecord, Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE chat_sessions
             SET assigned_agent_id = $3, assigned_at = $4
             WHERE session_id = $1 AND status = 'active' AND assigned_agent_id = $2",
        )
        .bind(session_id)
        .bind(from_agent)
        .bind(to_agent)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get(session_id).await? {
                None => Err(Error::SessionNotFound(session_id.to_string())),
                Some(_) => Err(Error::NotAssigned { agent_id: from_agent, session_id }),
            };
        }

        let reserved = sqlx::query(
            "UPDATE agent_presence
             SET current_chats = current_chats + 1, last_active_at = $2
             WHERE user_id = $1 AND state = 'online' AND current_chats < max_chats",
        )
        .bind(to_agent)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.classify_reserve_failure(to_agent, true).await?);
        }

        sqlx::query(
            "UPDATE agent_presence
             SET current_chats = GREATEST(current_chats - 1, 0), last_active_at = $2
             WHERE user_id = $1",
        )
        .bind(from_agent)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let system_message = ChatMessage::system(session_id, system_note);
        insert_message(&mut tx, &system_message).await?;

        let session = Self::fetch_session_tx(&mut *tx, session_id).await?;
        let from = Self::fetch_presence_tx(&mut *tx, from_agent).await?;
        let to = Self::fetch_presence_tx(&mut *tx, to_agent).await?;
        tx.commit().await?;

        Ok(TransferRecord { session, from_agent: from, to_agent: to, system_message })
    }

    async fn resolve(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        notes: Option<&str>,
        system_note: &str,
    ) -> Result<ClosureRecord, Error> {
        let mut tx = self.pool.begin().await?;

        // The system message must not postdate resolved_at, so its
        // timestamp is taken before `now`.
        let system_message = ChatMessage::system(session_id, system_note);
        let now = Utc::now();

        let closed = sqlx::query(
            "UPDATE chat_sessions
             SET status = 'resolved', resolved_at = $3, resolve_notes = $4
             WHERE session_id = $1 AND status = 'active' AND assigned_agent_id = $2",
        )
        .bind(session_id)
        .bind(agent_id)
        .bind(now)
        .bind(notes)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get(session_id).await? {
                None => Err(Error::SessionNotFound(session_id.to_string())),
                Some(_) => Err(Error::NotAssigned { agent_id, session_id }),
            };
        }

        insert_message(&mut tx, &system_message).await?;

        sqlx::query(
            "UPDATE agent_presence
             SET current_chats = GREATEST(current_chats - 1, 0), last_active_at = $2
             WHERE user_id = $1",
        )
        .bind(agent_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let session = Self::fetch_session_tx(&mut *tx, session_id).await?;
        let released = Self::fetch_presence_tx(&mut *tx, agent_id).await?;
        tx.commit().await?;

        Ok(ClosureRecord { session, released: Some(released), system_message })
    }

    async fn abandon(&self, session_id: Uuid, system_note: &str) -> Result<ClosureRecord, Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE session_id = $1 FOR UPDATE"
        ))
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let before = match row {
            Some(r) => session_from_row(&r)?,
            None => {
                tx.rollback().await?;
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
        };

        if before.is_terminal() {
            // Ending an already-closed chat: the client's view is stale and
            // the recovery is the same as for a purged session.
            tx.rollback().await?;
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        let system_message = ChatMessage::system(session_id, system_note);
        insert_message(&mut tx, &system_message).await?;

        // resolved_at must not precede the closing system message.
        let now = Utc::now();
        sqlx::query(
            "UPDATE chat_sessions
             SET status = 'abandoned', resolved_at = $2
             WHERE session_id = $1",
        )
        .bind(session_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let released = match (before.status, before.assigned_agent_id) {
            (SessionStatus::Active, Some(agent_id)) => {
                sqlx::query(
                    "UPDATE agent_presence
                     SET current_chats = GREATEST(current_chats - 1, 0)
                     WHERE user_id = $1",
                )
                .bind(agent_id)
                .execute(&mut *tx)
                .await?;
                Some(Self::fetch_presence_tx(&mut *tx, agent_id).await?)
            }
            _ => None,
        };

        let session = Self::fetch_session_tx(&mut *tx, session_id).await?;
        tx.commit().await?;

        Ok(ClosureRecord { session, released, system_message })
    }

    async fn set_rating(
        &self,
        session_id: Uuid,
        rating: i32,
        feedback: Option<&str>,
    ) -> Result<ChatSession, Error> {
        let updated = sqlx::query(
            "UPDATE chat_sessions
             SET rating = $2, feedback = $3
             WHERE session_id = $1 AND status = 'resolved'",
        )
        .bind(session_id)
        .bind(rating)
        .bind(feedback)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.get(session_id).await? {
                None => Err(Error::SessionNotFound(session_id.to_string())),
                Some(_) => Err(Error::store(
                    livedesk_common::error::StoreOp::Rating,
                    "session is not resolved",
                )),
            };
        }

        self.get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    async fn idle_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChatSession>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions s
             WHERE s.status IN ('waiting', 'active')
               AND COALESCE(
                     (SELECT MAX(m.created_at) FROM chat_messages m
                      WHERE m.session_id = s.session_id),
                     s.created_at
                   ) < $1
             ORDER BY s.created_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }
}
