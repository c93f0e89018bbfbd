use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use livedesk_common::models::{StaffRole, User};
use livedesk_common::traits::UserRepository;
use livedesk_common::Error;

fn user_from_row(r: &PgRow) -> Result<User, Error> {
    let role: String = r.try_get("role")?;
    Ok(User {
        user_id: r.try_get("user_id")?,
        username: r.try_get("username")?,
        email: r.try_get("email")?,
        display_name: r.try_get("display_name")?,
        role: StaffRole::from_str(&role)?,
        is_active: r.try_get("is_active")?,
        created_at: r.try_get("created_at")?,
        last_login_at: r.try_get("last_login_at")?,
    })
}

pub struct PostgresUserRepository {
    pool: Pool<Postgres>,
}

impl PostgresUserRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create(&self, user: &User) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO users (
                user_id, username, email, display_name, role,
                is_active, created_at, last_login_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.last_login_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<User>, Error> {
        let row = sqlx::query(
            "SELECT user_id, username, email, display_name, role,
                    is_active, created_at, last_login_at
             FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, Error> {
        let row = sqlx::query(
            "SELECT user_id, username, email, display_name, role,
                    is_active, created_at, last_login_at
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<User>, Error> {
        let rows = sqlx::query(
            "SELECT user_id, username, email, display_name, role,
                    is_active, created_at, last_login_at
             FROM users WHERE is_active = TRUE ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }
}
