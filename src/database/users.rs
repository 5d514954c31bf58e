//! User rows. `total_activity` is derived during graph precompute, not at
//! crawl time.

use sqlx::PgPool;

use crate::error::CrawlError;

#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Make sure a row exists for the username and return its id.
    pub async fn ensure(&self, username: &str) -> Result<i32, CrawlError> {
        let id: (i32,) = sqlx::query_as(
            "INSERT INTO users (username) VALUES ($1) \
             ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username \
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.0)
    }

    /// Every user `(id, username)`, for graph materialization.
    pub async fn all(&self) -> Result<Vec<(i32, String)>, CrawlError> {
        let rows: Vec<(i32, String)> =
            sqlx::query_as("SELECT id, username FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn set_total_activity(&self, user_id: i32, total: i64) -> Result<(), CrawlError> {
        sqlx::query("UPDATE users SET total_activity = $2 WHERE id = $1")
            .bind(user_id)
            .bind(total)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
