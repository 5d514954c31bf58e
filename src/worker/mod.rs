//! Crawl workers and the periodic queue sweeper.
//!
//! N workers share the queue, the upstream source, and the stores. Each
//! iteration claims one job with a short timeout (so shutdown is always
//! observed promptly), crawls the subreddit front to back, persists what
//! it can, feeds discovery, and marks the job. Sweeps that mutate the
//! queue globally (stale requeue, retry requeue, stall reset, aging) run
//! in a single dedicated task.

pub mod discovery;

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::seq::SliceRandom;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::CrawlSource;
use crate::config::Config;
use crate::database::{
    timestamp_from_epoch, CommentStore, NewComment, NewPost, PostStore, SubredditStore, UserStore,
};
use crate::error::CrawlError;
use crate::queue::{CrawlJob, JobQueue};
use crate::shutdown::{self, Signal};

pub use discovery::{extract_mentions, Discovery, SeenUsers};

/// Claim calls get their own deadline so a slow database cannot keep a
/// worker from noticing shutdown.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(10);
/// Sleep when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(5);
/// Pause between sweep rounds.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Queued jobs older than this get a priority boost each sweep.
const AGE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);
const AGE_BOOST: i32 = 10;

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub source: Arc<dyn CrawlSource>,
    pub subreddits: SubredditStore,
    pub users: UserStore,
    pub posts: PostStore,
    pub comments: CommentStore,
    pub discovery: Discovery,
    pub cfg: Arc<Config>,
}

#[derive(Debug, Default)]
struct CrawlStats {
    posts: usize,
    comments: usize,
    discovered: usize,
}

/// One crawl worker. Spawn as many as configured; they coordinate purely
/// through the queue's skip-locked claims.
pub struct Worker {
    worker_id: Uuid,
    index: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(index: usize, ctx: Arc<WorkerContext>) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            index,
            ctx,
        }
    }

    pub async fn run(self, signal: Signal) {
        info!(worker = self.index, worker_id = %self.worker_id, "crawl worker started");
        loop {
            if shutdown::is_triggered(&signal) {
                break;
            }

            let claimed = tokio::select! {
                result = tokio::time::timeout(CLAIM_TIMEOUT, self.ctx.queue.claim()) => result,
                _ = shutdown::triggered(&signal) => break,
            };

            let job = match claimed {
                Ok(Ok(Some(job))) => job,
                Ok(Ok(None)) => {
                    self.idle(&signal).await;
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(worker = self.index, error = %err, "claim failed");
                    if !shutdown::sleep(&signal, IDLE_SLEEP).await {
                        break;
                    }
                    continue;
                }
                Err(_) => continue, // claim timed out; re-check shutdown and retry
            };

            if !self.process(&signal, job).await {
                break;
            }
        }
        info!(worker = self.index, "crawl worker stopped");
    }

    /// Nothing claimable: optionally reseed, then nap.
    async fn idle(&self, signal: &Signal) {
        if self.ctx.cfg.seed_when_idle {
            let seed = {
                let mut rng = rand::thread_rng();
                self.ctx.cfg.default_subreddits.choose(&mut rng).cloned()
            };
            if let Some(name) = seed {
                match self.ctx.subreddits.ensure(&name).await {
                    Ok(id) => {
                        if let Err(err) = self.ctx.queue.enqueue(id, "idle-seed").await {
                            warn!(subreddit = %name, error = %err, "idle seeding failed");
                        }
                    }
                    Err(err) => warn!(subreddit = %name, error = %err, "idle seeding failed"),
                }
            }
        }
        shutdown::sleep(signal, IDLE_SLEEP).await;
    }

    /// Run one claimed job to completion. Returns `false` when the worker
    /// should exit (shutdown observed mid-job).
    async fn process(&self, signal: &Signal, job: CrawlJob) -> bool {
        let started = Instant::now();
        let span = info_span!(
            "crawl_job",
            job_id = job.id,
            subreddit = tracing::field::Empty,
            posts_count = tracing::field::Empty,
        );

        let outcome = self.crawl_job(signal, &job).instrument(span.clone()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(stats) => {
                span.record("posts_count", stats.posts as u64);
                if let Err(err) = self
                    .ctx
                    .queue
                    .mark_success(job.id, elapsed.as_millis() as i64)
                    .await
                {
                    warn!(job_id = job.id, error = %err, "failed to mark job success");
                }
                counter!("jobs_total", "status" => "success").increment(1);
                histogram!("job_duration_seconds").record(elapsed.as_secs_f64());
                info!(
                    job_id = job.id,
                    posts = stats.posts,
                    comments = stats.comments,
                    discovered = stats.discovered,
                    duration_ms = elapsed.as_millis() as u64,
                    "job complete"
                );
                true
            }
            Err(CrawlError::Cancelled) => {
                // Not a failure: the stall sweep will requeue the job.
                info!(job_id = job.id, "job interrupted by shutdown");
                false
            }
            Err(err) => {
                warn!(job_id = job.id, kind = err.kind(), error = %err, "job failed");
                if let Err(mark_err) = self
                    .ctx
                    .queue
                    .mark_failed_with_retry(job.id, job.retries)
                    .await
                {
                    warn!(job_id = job.id, error = %mark_err, "failed to mark job failed");
                }
                counter!("jobs_total", "status" => "failed").increment(1);
                true
            }
        }
    }

    /// about → posts → per-post comments → discovery. Per-entity failures
    /// are logged and skipped; boundary failures bubble up and fail the
    /// job.
    async fn crawl_job(&self, signal: &Signal, job: &CrawlJob) -> Result<CrawlStats, CrawlError> {
        let ctx = &self.ctx;
        let name = ctx
            .subreddits
            .name_of(job.subreddit_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound {
                status: 0,
                message: format!("crawl job {} references unknown subreddit", job.id),
            })?;
        tracing::Span::current().record("subreddit", name.as_str());

        let about = ctx.source.subreddit_about(signal, &name).await?;
        let subreddit_id = ctx
            .subreddits
            .upsert_meta(
                &name,
                &about.title,
                &about.public_description,
                about.subscribers,
            )
            .await?;

        let raw_posts = ctx
            .source
            .subreddit_posts(signal, &name, ctx.cfg.max_posts_per_sub)
            .await?;

        let mut stats = CrawlStats::default();
        let mut comment_authors: Vec<String> = Vec::new();

        for raw in &raw_posts {
            if raw.id.is_empty() {
                continue;
            }
            let author_id = self.resolve_author(&raw.author).await;
            let post = NewPost {
                id: raw.id.clone(),
                subreddit_id,
                author_id,
                title: raw.title.clone(),
                score: raw.score,
                flair: raw.link_flair_text.clone(),
                url: raw.url.clone(),
                is_self: raw.is_self,
                created_at: timestamp_from_epoch(raw.created_utc),
            };
            if let Err(err) = ctx.posts.upsert(&post).await {
                warn!(post_id = %raw.id, error = %err, "skipping post row");
                continue;
            }
            stats.posts += 1;
            counter!("posts_processed").increment(1);

            let comments = match ctx.source.comment_tree(signal, &raw.id).await {
                Ok(comments) => comments,
                Err(CrawlError::Cancelled) => return Err(CrawlError::Cancelled),
                Err(err) => {
                    warn!(post_id = %raw.id, kind = err.kind(), error = %err, "comment fetch failed");
                    continue;
                }
            };

            let mut rows = Vec::with_capacity(comments.len());
            for comment in &comments {
                let author_id = self.resolve_author(&comment.author).await;
                if author_id.is_some() {
                    comment_authors.push(comment.author.clone());
                }
                rows.push(NewComment {
                    id: comment.id.clone(),
                    post_id: raw.id.clone(),
                    subreddit_id,
                    author_id,
                    body: comment.body.clone(),
                    parent_id: comment.parent_id.clone(),
                    depth: comment.depth,
                    score: comment.score,
                    created_at: timestamp_from_epoch(comment.created_utc),
                });
            }
            let inserted = ctx.comments.insert_tree(&raw.id, rows).await?;
            stats.comments += inserted;
            counter!("comments_processed").increment(inserted as u64);
        }

        stats.discovered += ctx.discovery.enqueue_mentions(&raw_posts).await?;

        comment_authors.sort();
        comment_authors.dedup();
        for author in &comment_authors {
            match ctx
                .discovery
                .discover_author(signal, ctx.source.as_ref(), author)
                .await
            {
                Ok(n) => stats.discovered += n,
                Err(CrawlError::Cancelled) => return Err(CrawlError::Cancelled),
                Err(err) => {
                    warn!(author, kind = err.kind(), error = %err, "author discovery failed");
                }
            }
        }

        Ok(stats)
    }

    /// Upsert the author row, returning `None` for deleted/anonymous
    /// authors or on a row failure (logged and skipped).
    async fn resolve_author(&self, author: &str) -> Option<i32> {
        if author.is_empty() || author == "[deleted]" {
            return None;
        }
        match self.ctx.users.ensure(author).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(author, error = %err, "skipping user row");
                None
            }
        }
    }
}

/// Periodic queue maintenance, run by exactly one task.
pub struct Sweeper {
    queue: Arc<JobQueue>,
    cfg: Arc<Config>,
}

impl Sweeper {
    pub fn new(queue: Arc<JobQueue>, cfg: Arc<Config>) -> Self {
        Self { queue, cfg }
    }

    pub async fn run(self, signal: Signal) {
        info!("queue sweeper started");
        loop {
            if shutdown::is_triggered(&signal) {
                break;
            }
            self.sweep_once().await;
            if !shutdown::sleep(&signal, SWEEP_INTERVAL).await {
                break;
            }
        }
        info!("queue sweeper stopped");
    }

    async fn sweep_once(&self) {
        if let Err(err) = self.queue.reset_incomplete(self.cfg.incomplete_job_ttl).await {
            warn!(error = %err, "reset_incomplete sweep failed");
        }
        if let Err(err) = self.queue.requeue_retryable().await {
            warn!(error = %err, "requeue_retryable sweep failed");
        }
        if let Err(err) = self.queue.requeue_stale(self.cfg.stale_subreddit_ttl).await {
            warn!(error = %err, "requeue_stale sweep failed");
        }
        if let Err(err) = self.queue.age_starved(AGE_AFTER, AGE_BOOST).await {
            warn!(error = %err, "age_starved sweep failed");
        }
    }
}

/// Insert the configured seed subreddits and their jobs. Idempotent.
pub async fn seed_defaults(
    cfg: &Config,
    subreddits: &SubredditStore,
    queue: &JobQueue,
) -> Result<usize, CrawlError> {
    let mut seeded = 0;
    for name in &cfg.default_subreddits {
        let id = subreddits.ensure(name).await?;
        if queue.enqueue(id, "seed").await? {
            seeded += 1;
        }
    }
    info!(seeded, total = cfg.default_subreddits.len(), "seed subreddits enqueued");
    Ok(seeded)
}
