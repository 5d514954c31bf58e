//! Derived activity tallies: per-user-per-subreddit counts and the
//! symmetric subreddit co-occurrence relationships.

use sqlx::PgPool;

use crate::error::CrawlError;

#[derive(Clone)]
pub struct ActivityStore {
    pool: PgPool,
}

impl ActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count a user's posts and comments per subreddit.
    pub async fn user_activity(&self, user_id: i32) -> Result<Vec<(i32, i64)>, CrawlError> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT subreddit_id, COUNT(*)::bigint FROM ( \
                 SELECT subreddit_id FROM posts WHERE author_id = $1 \
                 UNION ALL \
                 SELECT subreddit_id FROM comments WHERE author_id = $1 \
             ) activity GROUP BY subreddit_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_activity(
        &self,
        user_id: i32,
        subreddit_id: i32,
        count: i64,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO user_subreddit_activity (user_id, subreddit_id, activity_count) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, subreddit_id) DO UPDATE SET \
                 activity_count = EXCLUDED.activity_count",
        )
        .bind(user_id)
        .bind(subreddit_id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All activity rows, grouped downstream for co-occurrence.
    pub async fn all_activity(&self) -> Result<Vec<(i32, i32, i64)>, CrawlError> {
        let rows: Vec<(i32, i32, i64)> = sqlx::query_as(
            "SELECT user_id, subreddit_id, activity_count \
             FROM user_subreddit_activity ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Upsert one direction of a subreddit relationship. Callers write
    /// both directions; the table's primary key is the ordered pair.
    pub async fn upsert_relationship(
        &self,
        source_id: i32,
        target_id: i32,
        overlap_count: i64,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO subreddit_relationships (source_id, target_id, overlap_count) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (source_id, target_id) DO UPDATE SET \
                 overlap_count = EXCLUDED.overlap_count",
        )
        .bind(source_id)
        .bind(target_id)
        .bind(overlap_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All relationship rows, for link materialization.
    pub async fn all_relationships(&self) -> Result<Vec<(i32, i32, i64)>, CrawlError> {
        let rows: Vec<(i32, i32, i64)> = sqlx::query_as(
            "SELECT source_id, target_id, overlap_count FROM subreddit_relationships",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
