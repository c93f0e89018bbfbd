use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use livedesk_common::error::StoreOp;
use livedesk_common::models::{ChatMessage, MessageKind, SenderType};
use livedesk_common::traits::MessageRepository;
use livedesk_common::Error;

pub(crate) fn message_from_row(r: &PgRow) -> Result<ChatMessage, Error> {
    let sender: String = r.try_get("sender_type")?;
    let kind: String = r.try_get("kind")?;
    Ok(ChatMessage {
        message_id: r.try_get("message_id")?,
        session_id: r.try_get("session_id")?,
        sender_type: SenderType::from_str(&sender)?,
        sender_id: r.try_get("sender_id")?,
        content: r.try_get("content")?,
        kind: MessageKind::from_str(&kind)?,
        file_ref: r.try_get("file_ref")?,
        created_at: r.try_get("created_at")?,
    })
}

/// Unconditional insert used inside transition transactions, where the
/// caller has already locked or guarded the session row.
pub(crate) async fn insert_message(
    tx: &mut Transaction<'_, Postgres>,
    msg: &ChatMessage,
) -> Result<(), Error> {
    let conn: &mut PgConnection = &mut *tx;
    sqlx::query(
        r#"
        INSERT INTO chat_messages (
            message_id, session_id, sender_type, sender_id,
            content, kind, file_ref, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(msg.message_id)
    .bind(msg.session_id)
    .bind(msg.sender_type.as_str())
    .bind(msg.sender_id)
    .bind(&msg.content)
    .bind(msg.kind.as_str())
    .bind(&msg.file_ref)
    .bind(msg.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub struct PostgresMessageRepository {
    pool: Pool<Postgres>,
}

impl PostgresMessageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    async fn append(&self, message: &ChatMessage) -> Result<(), Error> {
        // The WHERE EXISTS guard makes append and the terminal transition
        // serialisable: nothing lands after resolved_at.
        let res = sqlx::query(
            r#"
            INSERT INTO chat_messages (
                message_id, session_id, sender_type, sender_id,
                content, kind, file_ref, created_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE EXISTS (
                SELECT 1 FROM chat_sessions
                WHERE session_id = $2 AND status IN ('waiting', 'active')
            )
            "#,
        )
        .bind(message.message_id)
        .bind(message.session_id)
        .bind(message.sender_type.as_str())
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(&message.file_ref)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::store(StoreOp::Send, "session is closed or unknown"));
        }
        Ok(())
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, Error> {
        let rows = sqlx::query(
            "SELECT message_id, session_id, sender_type, sender_id,
                    content, kind, file_ref, created_at
             FROM chat_messages
             WHERE session_id = $1
             ORDER BY created_at, message_id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn last_activity(&self, session_id: Uuid) -> Result<Option<DateTime<Utc>>, Error> {
        let row = sqlx::query(
            "SELECT MAX(created_at) AS last_at FROM chat_messages WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_at")?)
    }
}
