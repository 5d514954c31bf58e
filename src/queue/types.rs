//! Crawl-job row types and the job state machine.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Lifecycle of a crawl job.
///
/// ```text
/// (new) ──enqueue──▶ queued ──claim──▶ crawling ──success──▶ success
///                       ▲                  │
///                       │                  └──fail──▶ failed
///                       │                               │
///            requeue_retryable / reset_incomplete ◀─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Crawling,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Crawling => "crawling",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "crawling" => Some(JobStatus::Crawling),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are retained for audit and never deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// One row of `crawl_jobs`. At most one job exists per subreddit; the
/// unique index on `subreddit_id` enforces it.
#[derive(Debug, Clone, FromRow)]
pub struct CrawlJob {
    pub id: i32,
    pub subreddit_id: i32,
    pub status: String,
    pub priority: i32,
    pub retries: i32,
    pub visible_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub enqueued_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlJob {
    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status).unwrap_or(JobStatus::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Crawling,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Crawling.is_terminal());
    }
}
