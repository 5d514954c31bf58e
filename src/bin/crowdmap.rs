//! crowdmap daemon: seeds the queue, runs the crawl workers and queue
//! sweeper, keeps the OAuth token fresh, and ticks the graph precompute.
//! Ctrl-C flips the shutdown signal; every loop drains within a second.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crowdmap::api::{ApiClient, CrawlSource};
use crowdmap::auth::TokenManager;
use crowdmap::config::{mask, Config};
use crowdmap::database::{self, CommentStore, PostStore, SubredditStore, UserStore};
use crowdmap::graph::GraphBuilder;
use crowdmap::http::Fetcher;
use crowdmap::queue::JobQueue;
use crowdmap::ratelimit::{self, RateBucket};
use crowdmap::shutdown;
use crowdmap::worker::{self, Discovery, SeenUsers, Sweeper, Worker, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crowdmap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(Config::from_env()?);
    info!(
        client_id = %mask(&cfg.credentials.client_id),
        workers = cfg.workers,
        rps = cfg.rps,
        "crowdmap starting"
    );

    let pool = database::connect(&cfg).await?;
    database::migrate(&pool).await?;

    let (shutdown_tx, signal) = shutdown::channel();

    // Fetch pipeline: bucket → fetcher → token manager → API client.
    let bucket = Arc::new(RateBucket::new(cfg.rps, cfg.burst_size));
    ratelimit::install_global(bucket.clone());
    let fetcher = Arc::new(Fetcher::new(&cfg, bucket)?);
    let tokens = Arc::new(TokenManager::new(&cfg, fetcher.clone())?);
    let source: Arc<dyn CrawlSource> =
        Arc::new(ApiClient::new(&cfg, fetcher.clone(), tokens.clone()));

    // Queue and stores.
    let max_retries = (cfg.max_retries > 0).then_some(cfg.max_retries);
    let queue = Arc::new(JobQueue::new(pool.clone(), max_retries).await?);
    let subreddits = SubredditStore::new(pool.clone());
    let seen_users = Arc::new(SeenUsers::new());
    let discovery = Discovery::new(
        queue.clone(),
        subreddits.clone(),
        seen_users,
        cfg.fetch_user_subreddits,
        cfg.user_sub_enqueue_max,
    );

    worker::seed_defaults(&cfg, &subreddits, &queue).await?;

    let ctx = Arc::new(WorkerContext {
        queue: queue.clone(),
        source,
        subreddits,
        users: UserStore::new(pool.clone()),
        posts: PostStore::new(pool.clone()),
        comments: CommentStore::new(pool.clone()),
        discovery,
        cfg: cfg.clone(),
    });

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        tokens.clone().run_refresh_loop(signal.clone()),
    ));
    tasks.push(tokio::spawn(
        Sweeper::new(queue.clone(), cfg.clone()).run(signal.clone()),
    ));
    for index in 0..cfg.workers {
        tasks.push(tokio::spawn(Worker::new(index, ctx.clone()).run(signal.clone())));
    }
    tasks.push(tokio::spawn(
        GraphBuilder::new(pool.clone(), cfg.clone()).run_loop(signal.clone()),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!("crowdmap stopped");
    Ok(())
}
