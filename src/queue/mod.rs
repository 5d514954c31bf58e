//! Durable crawl-job queue over Postgres.
//!
//! All queries are runtime-checked (`sqlx::query`, not the compile-time
//! macros) because the tables come from migrations that may not exist at
//! compile time. Claims use `FOR UPDATE SKIP LOCKED` so any number of
//! concurrent workers never hand out the same row twice.

pub mod types;

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::CrawlError;

pub use types::{CrawlJob, JobStatus};

/// Retry backoff base: one minute doubled per retry.
const BASE_BACKOFF: Duration = Duration::from_secs(60);
/// Retry backoff ceiling before jitter.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

const JOB_COLUMNS: &str = "crawl_jobs.id, crawl_jobs.subreddit_id, crawl_jobs.status, \
     crawl_jobs.priority, crawl_jobs.retries, crawl_jobs.visible_at, \
     crawl_jobs.next_retry_at, crawl_jobs.last_attempt, crawl_jobs.duration_ms, \
     crawl_jobs.enqueued_by, crawl_jobs.created_at, crawl_jobs.updated_at";

/// Postgres-backed queue of per-subreddit crawl jobs.
pub struct JobQueue {
    pool: PgPool,
    /// `max_retries` ceiling for requeueing failed jobs. `None` means no
    /// limit (the NULL-in-DB semantics of the original deployment).
    max_retries: Option<i32>,
    /// Older deployments lack the `visible_at` column; probed once at
    /// startup so claims can fall back to the simpler select.
    has_visible_at: bool,
}

impl JobQueue {
    pub async fn new(pool: PgPool, max_retries: Option<i32>) -> Result<Self, CrawlError> {
        let has_visible_at = sqlx::query(
            "SELECT 1 FROM information_schema.columns \
             WHERE table_name = 'crawl_jobs' AND column_name = 'visible_at'",
        )
        .fetch_optional(&pool)
        .await?
        .is_some();
        if !has_visible_at {
            warn!("crawl_jobs.visible_at missing; claims fall back to the legacy select");
        }
        Ok(Self {
            pool,
            max_retries,
            has_visible_at,
        })
    }

    /// Insert a queued job for the subreddit. Idempotent: the unique index
    /// on `subreddit_id` makes a duplicate enqueue a no-op. Returns whether
    /// a row was actually inserted.
    pub async fn enqueue(&self, subreddit_id: i32, enqueued_by: &str) -> Result<bool, CrawlError> {
        let result = sqlx::query(
            "INSERT INTO crawl_jobs (subreddit_id, status, priority, enqueued_by) \
             VALUES ($1, 'queued', 0, $2) \
             ON CONFLICT (subreddit_id) DO NOTHING",
        )
        .bind(subreddit_id)
        .bind(enqueued_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim the best queued job, if any.
    ///
    /// Highest priority first, oldest first within a priority; rows held by
    /// a concurrent claimer are skipped rather than waited on. `None` is
    /// the no-job sentinel.
    pub async fn claim(&self) -> Result<Option<CrawlJob>, CrawlError> {
        let (visibility, columns) = if self.has_visible_at {
            (
                "AND (visible_at IS NULL OR visible_at <= now())",
                JOB_COLUMNS.to_string(),
            )
        } else {
            // Legacy schema: synthesize the column so the row type decodes.
            (
                "",
                JOB_COLUMNS.replace(
                    "crawl_jobs.visible_at",
                    "NULL::timestamptz AS visible_at",
                ),
            )
        };
        let sql = format!(
            "WITH claimed AS ( \
                 SELECT id FROM crawl_jobs \
                 WHERE status = 'queued' {visibility} \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE crawl_jobs \
             SET status = 'crawling', last_attempt = now(), updated_at = now() \
             FROM claimed \
             WHERE crawl_jobs.id = claimed.id \
             RETURNING {columns}"
        );
        let job = sqlx::query_as::<_, CrawlJob>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(job) = &job {
            debug!(job_id = job.id, subreddit_id = job.subreddit_id, "job claimed");
        }
        Ok(job)
    }

    pub async fn mark_success(&self, id: i32, duration_ms: i64) -> Result<(), CrawlError> {
        sqlx::query(
            "UPDATE crawl_jobs \
             SET status = 'success', duration_ms = $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail the job and schedule its next retry window.
    pub async fn mark_failed_with_retry(&self, id: i32, retries: i32) -> Result<(), CrawlError> {
        let next_retry = Utc::now()
            + chrono::Duration::from_std(retry_backoff(retries))
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        sqlx::query(
            "UPDATE crawl_jobs \
             SET status = 'failed', retries = retries + 1, next_retry_at = $2, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(next_retry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move failed jobs whose retry window has opened back to `queued`.
    /// Jobs at the retry ceiling stay failed for audit.
    pub async fn requeue_retryable(&self) -> Result<u64, CrawlError> {
        let set_visibility = if self.has_visible_at {
            ", visible_at = now()"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE crawl_jobs \
             SET status = 'queued', updated_at = now() {set_visibility} \
             WHERE status = 'failed' \
               AND next_retry_at IS NOT NULL AND next_retry_at <= now() \
               AND ($1::int IS NULL OR retries < $1)"
        );
        let result = sqlx::query(&sql)
            .bind(self.max_retries)
            .execute(&self.pool)
            .await?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            info!(requeued, "failed jobs requeued for retry");
        }
        Ok(requeued)
    }

    /// Sweep jobs stuck in `crawling` past the stall TTL back to `queued`;
    /// recovers work lost to crashed workers.
    pub async fn reset_incomplete(&self, ttl: Duration) -> Result<u64, CrawlError> {
        let result = sqlx::query(
            "UPDATE crawl_jobs \
             SET status = 'queued', updated_at = now() \
             WHERE status = 'crawling' \
               AND updated_at < now() - make_interval(secs => $1)",
        )
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        let reset = result.rows_affected();
        if reset > 0 {
            warn!(reset, "stalled crawling jobs reset to queued");
        }
        Ok(reset)
    }

    /// Re-enqueue subreddits not crawled within the TTL: terminal job rows
    /// flip back to `queued` with a fresh retry budget, and subreddits with
    /// no job row yet get one.
    pub async fn requeue_stale(&self, ttl: Duration) -> Result<u64, CrawlError> {
        let secs = ttl.as_secs_f64();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO crawl_jobs (subreddit_id, status, priority, enqueued_by) \
             SELECT s.id, 'queued', 0, 'stale-sweep' FROM subreddits s \
             WHERE s.last_seen IS NULL OR s.last_seen < now() - make_interval(secs => $1) \
             ON CONFLICT (subreddit_id) DO NOTHING",
        )
        .bind(secs)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let refreshed = sqlx::query(
            "UPDATE crawl_jobs \
             SET status = 'queued', retries = 0, next_retry_at = NULL, updated_at = now() \
             FROM subreddits s \
             WHERE crawl_jobs.subreddit_id = s.id \
               AND crawl_jobs.status IN ('success', 'failed') \
               AND s.last_seen < now() - make_interval(secs => $1)",
        )
        .bind(secs)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        let total = inserted + refreshed;
        if total > 0 {
            info!(inserted, refreshed, "stale subreddits re-enqueued");
        }
        Ok(total)
    }

    /// Boost long-waiting queued jobs so the long tail is never starved by
    /// a steady stream of high-priority work. Priority caps at 100.
    pub async fn age_starved(&self, min_age: Duration, boost: i32) -> Result<u64, CrawlError> {
        let result = sqlx::query(
            "UPDATE crawl_jobs \
             SET priority = LEAST(priority + $2, 100), updated_at = now() \
             WHERE status = 'queued' \
               AND created_at < now() - make_interval(secs => $1) \
               AND priority < 100",
        )
        .bind(min_age.as_secs_f64())
        .bind(boost.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// User-facing prioritization. Priority never decreases; caps at 100.
    pub async fn bump_priority(&self, subreddit_id: i32, delta: i32) -> Result<(), CrawlError> {
        sqlx::query(
            "UPDATE crawl_jobs \
             SET priority = LEAST(priority + $2, 100), updated_at = now() \
             WHERE subreddit_id = $1",
        )
        .bind(subreddit_id)
        .bind(delta.max(0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Backoff before the next retry of a failed job:
/// `min(24h, 1min · 2^retries)` plus up to 20% jitter.
pub fn retry_backoff(retries: i32) -> Duration {
    let exp = retries.clamp(0, 30) as u32;
    let doubled = BASE_BACKOFF.saturating_mul(1u32 << exp.min(30));
    let capped = doubled.min(MAX_BACKOFF);
    let jitter = capped.mul_f64(rand::thread_rng().gen_range(0.0..0.2));
    capped + jitter
}
