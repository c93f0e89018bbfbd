use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use livedesk_common::models::ActivityLogEntry;
use livedesk_common::traits::ActivityLogRepository;
use livedesk_common::Error;

fn entry_from_row(r: &PgRow) -> Result<ActivityLogEntry, Error> {
    Ok(ActivityLogEntry {
        activity_id: r.try_get("activity_id")?,
        actor_id: r.try_get("actor_id")?,
        action: r.try_get("action")?,
        session_id: r.try_get("session_id")?,
        detail: r.try_get("detail")?,
        created_at: r.try_get("created_at")?,
    })
}

pub struct PostgresActivityLogRepository {
    pool: Pool<Postgres>,
}

impl PostgresActivityLogRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityLogRepository for PostgresActivityLogRepository {
    async fn insert(&self, entry: &ActivityLogEntry) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (
                activity_id, actor_id, action, session_id, detail, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.activity_id)
        .bind(entry.actor_id)
        .bind(&entry.action)
        .bind(entry.session_id)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<ActivityLogEntry>, Error> {
        let rows = sqlx::query(
            "SELECT activity_id, actor_id, action, session_id, detail, created_at
             FROM activity_log ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}
