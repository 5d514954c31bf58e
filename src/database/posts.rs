//! Post rows, keyed on the upstream's opaque string id.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CrawlError;

/// A post ready for persistence; authors are resolved to row ids first.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub subreddit_id: i32,
    pub author_id: Option<i32>,
    pub title: String,
    pub score: i64,
    pub flair: Option<String>,
    pub url: String,
    pub is_self: bool,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PostStore {
    pool: PgPool,
}

impl PostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent upsert; score and flair refresh on re-crawl.
    pub async fn upsert(&self, post: &NewPost) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO posts \
                 (id, subreddit_id, author_id, title, score, flair, url, is_self, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
                 score = EXCLUDED.score, \
                 flair = EXCLUDED.flair, \
                 title = EXCLUDED.title",
        )
        .bind(&post.id)
        .bind(post.subreddit_id)
        .bind(post.author_id)
        .bind(&post.title)
        .bind(post.score)
        .bind(&post.flair)
        .bind(&post.url)
        .bind(post.is_self)
        .bind(post.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Highest-scoring post ids per subreddit, for the detailed graph.
    pub async fn top_for_subreddit(
        &self,
        subreddit_id: i32,
        limit: i64,
    ) -> Result<Vec<(String, String, Option<i32>, i64)>, CrawlError> {
        let rows: Vec<(String, String, Option<i32>, i64)> = sqlx::query_as(
            "SELECT id, title, author_id, score FROM posts \
             WHERE subreddit_id = $1 \
             ORDER BY score DESC, id ASC \
             LIMIT $2",
        )
        .bind(subreddit_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
