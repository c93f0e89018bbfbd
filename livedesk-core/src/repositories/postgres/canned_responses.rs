use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use livedesk_common::models::CannedResponse;
use livedesk_common::traits::CannedResponseRepository;
use livedesk_common::Error;

fn canned_from_row(r: &PgRow) -> Result<CannedResponse, Error> {
    Ok(CannedResponse {
        canned_response_id: r.try_get("canned_response_id")?,
        title: r.try_get("title")?,
        content: r.try_get("content")?,
        shortcut: r.try_get("shortcut")?,
        created_by: r.try_get("created_by")?,
        is_active: r.try_get("is_active")?,
        created_at: r.try_get("created_at")?,
    })
}

pub struct PostgresCannedResponseRepository {
    pool: Pool<Postgres>,
}

impl PostgresCannedResponseRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CannedResponseRepository for PostgresCannedResponseRepository {
    async fn create(&self, canned: &CannedResponse) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO canned_responses (
                canned_response_id, title, content, shortcut,
                created_by, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(canned.canned_response_id)
        .bind(&canned.title)
        .bind(&canned.content)
        .bind(&canned.shortcut)
        .bind(canned.created_by)
        .bind(canned.is_active)
        .bind(canned.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CannedResponse>, Error> {
        let row = sqlx::query(
            "SELECT canned_response_id, title, content, shortcut,
                    created_by, is_active, created_at
             FROM canned_responses WHERE canned_response_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| canned_from_row(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<CannedResponse>, Error> {
        let rows = sqlx::query(
            "SELECT canned_response_id, title, content, shortcut,
                    created_by, is_active, created_at
             FROM canned_responses WHERE is_active = TRUE ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(canned_from_row).collect()
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), Error> {
        sqlx::query(
            "UPDATE canned_responses SET is_active = FALSE WHERE canned_response_id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
