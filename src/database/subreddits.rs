//! Subreddit rows. Names are stored lowercase and unique; metadata is
//! refreshed on every successful crawl together with `last_seen`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::error::CrawlError;

#[derive(Debug, Clone, FromRow)]
pub struct SubredditRow {
    pub id: i32,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub subscribers: i64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SubredditStore {
    pool: PgPool,
}

impl SubredditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Make sure a row exists for the name and return its id. The no-op
    /// `DO UPDATE` keeps `RETURNING` populated on conflict.
    pub async fn ensure(&self, name: &str) -> Result<i32, CrawlError> {
        let id: (i32,) = sqlx::query_as(
            "INSERT INTO subreddits (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id",
        )
        .bind(name.to_lowercase())
        .fetch_one(&self.pool)
        .await?;
        Ok(id.0)
    }

    /// Upsert crawl metadata and stamp `last_seen`.
    pub async fn upsert_meta(
        &self,
        name: &str,
        title: &str,
        description: &str,
        subscribers: i64,
    ) -> Result<i32, CrawlError> {
        let id: (i32,) = sqlx::query_as(
            "INSERT INTO subreddits (name, title, description, subscribers, last_seen) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (name) DO UPDATE SET \
                 title = EXCLUDED.title, \
                 description = EXCLUDED.description, \
                 subscribers = EXCLUDED.subscribers, \
                 last_seen = now() \
             RETURNING id",
        )
        .bind(name.to_lowercase())
        .bind(title)
        .bind(description)
        .bind(subscribers)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.0)
    }

    pub async fn name_of(&self, id: i32) -> Result<Option<String>, CrawlError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM subreddits WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    /// Every subreddit, for graph materialization.
    pub async fn all(&self) -> Result<Vec<SubredditRow>, CrawlError> {
        let rows = sqlx::query_as::<_, SubredditRow>(
            "SELECT id, name, title, description, subscribers, last_seen \
             FROM subreddits ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
