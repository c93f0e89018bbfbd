use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use livedesk_common::models::{AgentPresence, AgentState};
use livedesk_common::traits::PresenceRepository;
use livedesk_common::Error;

pub(crate) fn presence_from_row(r: &PgRow) -> Result<AgentPresence, Error> {
    let state: String = r.try_get("state")?;
    Ok(AgentPresence {
        user_id: r.try_get("user_id")?,
        state: AgentState::from_str(&state)?,
        current_chats: r.try_get("current_chats")?,
        max_chats: r.try_get("max_chats")?,
        last_active_at: r.try_get("last_active_at")?,
    })
}

pub struct PostgresPresenceRepository {
    pool: Pool<Postgres>,
}

impl PostgresPresenceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceRepository for PostgresPresenceRepository {
    async fn upsert(&self, presence: &AgentPresence) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO agent_presence (user_id, state, current_chats, max_chats, last_active_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET state = EXCLUDED.state,
                current_chats = EXCLUDED.current_chats,
                max_chats = EXCLUDED.max_chats,
                last_active_at = EXCLUDED.last_active_at
            "#,
        )
        .bind(presence.user_id)
        .bind(presence.state.as_str())
        .bind(presence.current_chats)
        .bind(presence.max_chats)
        .bind(presence.last_active_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<AgentPresence>, Error> {
        let row = sqlx::query(
            "SELECT user_id, state, current_chats, max_chats, last_active_at
             FROM agent_presence WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| presence_from_row(&r)).transpose()
    }

    async fn all(&self) -> Result<Vec<AgentPresence>, Error> {
        let rows = sqlx::query(
            "SELECT user_id, state, current_chats, max_chats, last_active_at
             FROM agent_presence",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(presence_from_row).collect()
    }

    async fn set_state(
        &self,
        user_id: Uuid,
        state: AgentState,
        max_chats_default: i32,
    ) -> Result<AgentPresence, Error> {
        // current_chats is left alone on conflict: going offline does not
        // release in-flight chats.
        let row = sqlx::query(
            r#"
            INSERT INTO agent_presence (user_id, state, current_chats, max_chats, last_active_at)
            VALUES ($1, $2, 0, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET state = EXCLUDED.state, last_active_at = EXCLUDED.last_active_at
            RETURNING user_id, state, current_chats, max_chats, last_active_at
            "#,
        )
        .bind(user_id)
        .bind(state.as_str())
        .bind(max_chats_default)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        presence_from_row(&row)
    }

    async fn set_all_offline(&self) -> Result<(), Error> {
        sqlx::query("UPDATE agent_presence SET state = 'offline'")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
