//! Environment-derived configuration.
//!
//! Everything is read once at startup from the process environment (with
//! `.env` support via dotenvy in the binary). Missing credentials are a
//! terminal configuration error; everything else has a workable default.

use std::time::Duration;

use crate::error::CrawlError;

/// Upstream OAuth credentials. Never logged raw; even `Debug` masks.
#[derive(Clone, Default)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &mask(&self.client_id))
            .field("client_secret", &mask(&self.client_secret))
            .finish()
    }
}

/// Full crawler + precompute configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Rate limiting
    pub rps: u32,
    pub burst_size: u32,

    // OAuth
    pub credentials: Credentials,
    pub user_agent: String,

    // HTTP
    pub http_timeout: Duration,
    pub http_max_attempts: u32,

    // Upstream endpoints. Overridable so tests can point at a local stub.
    pub oauth_base_url: String,
    pub www_base_url: String,

    // Listing caps
    pub max_posts_per_sub: usize,
    pub max_comments_per_post: usize,
    pub max_comment_depth: i32,
    pub posts_sort: String,
    pub posts_time_filter: String,

    // Seeds and discovery
    pub default_subreddits: Vec<String>,
    pub user_sub_fetch_limit: usize,
    pub user_sub_enqueue_max: usize,
    pub fetch_user_subreddits: bool,

    // Queue sweeps
    pub stale_subreddit_ttl: Duration,
    pub incomplete_job_ttl: Duration,
    pub max_retries: i32,

    // Workers
    pub workers: usize,
    pub seed_when_idle: bool,

    // Graph precompute
    pub precalc_interval: Duration,
    pub precalc_clear_on_start: bool,
    pub detailed_graph: bool,
    pub posts_per_sub_in_graph: usize,
    pub comments_per_post_in_graph: usize,
    pub max_author_content_links: usize,
    pub precalc_activity_workers: usize,
    pub graph_version_retention: usize,

    // Database
    pub database_url: String,
    pub database_pool_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rps: 1,
            burst_size: 5,
            credentials: Credentials::default(),
            user_agent: "crowdmap/0.1 (graph crawler)".to_string(),
            http_timeout: Duration::from_secs(30),
            http_max_attempts: 4,
            oauth_base_url: "https://oauth.reddit.com".to_string(),
            www_base_url: "https://www.reddit.com".to_string(),
            max_posts_per_sub: 100,
            max_comments_per_post: 100,
            max_comment_depth: 10,
            posts_sort: "top".to_string(),
            posts_time_filter: "all".to_string(),
            default_subreddits: ["askreddit", "programming", "worldnews"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            user_sub_fetch_limit: 50,
            user_sub_enqueue_max: 5,
            fetch_user_subreddits: true,
            stale_subreddit_ttl: Duration::from_secs(24 * 60 * 60),
            incomplete_job_ttl: Duration::from_secs(60 * 60),
            max_retries: 3,
            workers: 4,
            seed_when_idle: false,
            precalc_interval: Duration::from_secs(60 * 60),
            precalc_clear_on_start: false,
            detailed_graph: false,
            posts_per_sub_in_graph: 10,
            comments_per_post_in_graph: 20,
            max_author_content_links: 50,
            precalc_activity_workers: 4,
            graph_version_retention: 10,
            database_url: "postgresql://localhost/crowdmap".to_string(),
            database_pool_size: 10,
        }
    }
}

impl Config {
    /// Build from the process environment. Fails only on missing
    /// credentials; every other key falls back to its default.
    pub fn from_env() -> Result<Self, CrawlError> {
        let defaults = Config::default();

        let client_id = std::env::var("CLIENT_ID").unwrap_or_default();
        let client_secret = std::env::var("CLIENT_SECRET").unwrap_or_default();
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            return Err(CrawlError::Config(
                "CLIENT_ID and CLIENT_SECRET must be set".to_string(),
            ));
        }

        Ok(Self {
            rps: env_parse("CRAWLER_RPS", defaults.rps),
            burst_size: env_parse("CRAWLER_BURST_SIZE", defaults.burst_size),
            credentials: Credentials {
                client_id: client_id.trim().to_string(),
                client_secret: client_secret.trim().to_string(),
            },
            user_agent: env_string("USER_AGENT", &defaults.user_agent),
            http_timeout: env_secs("HTTP_TIMEOUT", defaults.http_timeout),
            http_max_attempts: env_parse("HTTP_MAX_ATTEMPTS", defaults.http_max_attempts).max(1),
            oauth_base_url: env_string("OAUTH_BASE_URL", &defaults.oauth_base_url),
            www_base_url: env_string("WWW_BASE_URL", &defaults.www_base_url),
            max_posts_per_sub: env_parse("MAX_POSTS_PER_SUB", defaults.max_posts_per_sub),
            max_comments_per_post: env_parse(
                "MAX_COMMENTS_PER_POST",
                defaults.max_comments_per_post,
            ),
            max_comment_depth: env_parse("MAX_COMMENT_DEPTH", defaults.max_comment_depth),
            posts_sort: env_string("POSTS_SORT", &defaults.posts_sort),
            posts_time_filter: env_string("POSTS_TIME_FILTER", &defaults.posts_time_filter),
            default_subreddits: env_list("DEFAULT_SUBREDDITS", &defaults.default_subreddits),
            user_sub_fetch_limit: env_parse("USER_SUB_FETCH_LIMIT", defaults.user_sub_fetch_limit),
            user_sub_enqueue_max: env_parse("USER_SUB_ENQUEUE_MAX", defaults.user_sub_enqueue_max),
            fetch_user_subreddits: env_bool("FETCH_USER_SUBREDDITS", defaults.fetch_user_subreddits),
            stale_subreddit_ttl: env_secs("STALE_SUBREDDIT_TTL", defaults.stale_subreddit_ttl),
            incomplete_job_ttl: env_secs("INCOMPLETE_JOB_TTL", defaults.incomplete_job_ttl),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            workers: env_parse("CRAWLER_WORKERS", defaults.workers).max(1),
            seed_when_idle: env_bool("SEED_WHEN_IDLE", defaults.seed_when_idle),
            precalc_interval: env_secs("PRECALC_INTERVAL_SECS", defaults.precalc_interval),
            precalc_clear_on_start: env_bool(
                "PRECALC_CLEAR_ON_START",
                defaults.precalc_clear_on_start,
            ),
            detailed_graph: env_bool("DETAILED_GRAPH", defaults.detailed_graph),
            posts_per_sub_in_graph: env_parse(
                "POSTS_PER_SUB_IN_GRAPH",
                defaults.posts_per_sub_in_graph,
            ),
            comments_per_post_in_graph: env_parse(
                "COMMENTS_PER_POST",
                defaults.comments_per_post_in_graph,
            ),
            max_author_content_links: env_parse(
                "MAX_AUTHOR_CONTENT_LINKS",
                defaults.max_author_content_links,
            ),
            precalc_activity_workers: env_parse(
                "PRECALC_ACTIVITY_WORKERS",
                defaults.precalc_activity_workers,
            )
            .max(1),
            graph_version_retention: env_parse(
                "GRAPH_VERSION_RETENTION",
                defaults.graph_version_retention,
            )
            .max(1),
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            database_pool_size: env_parse("DATABASE_POOL_SIZE", defaults.database_pool_size).max(1),
        })
    }
}

/// Mask a secret for logging: first four characters plus its length.
pub fn mask(secret: &str) -> String {
    let head: String = secret.chars().take(4).collect();
    format!("{head}…({})", secret.chars().count())
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => parse_bool(&v).unwrap_or(default),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &[String]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => parse_list(&v),
        _ => default.to_vec(),
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
