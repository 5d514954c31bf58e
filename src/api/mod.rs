//! Typed upstream operations.
//!
//! Every operation routes through the retrying fetcher, which in turn
//! paces on the global rate bucket and carries the managed bearer token.
//! Listing pagination additionally sleeps between pages so a deep
//! subreddit crawl cannot monopolize the bucket.

pub mod comments;
pub mod models;
mod users;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::CrawlError;
use crate::http::{Fetcher, RequestSpec};
use crate::shutdown::{self, Signal};

pub use models::{Listing, RawComment, RawPost, SubredditAbout, Thing};

/// Minimum pause between listing pages, on top of the rate bucket.
const PAGE_DELAY: Duration = Duration::from_secs(1);
/// Upstream page size ceiling.
const MAX_PAGE_SIZE: usize = 100;

/// Port the worker crawls through; mocked in tests.
#[async_trait]
pub trait CrawlSource: Send + Sync {
    async fn subreddit_about(
        &self,
        signal: &Signal,
        name: &str,
    ) -> Result<SubredditAbout, CrawlError>;

    /// Pages through the configured listing until `target_posts` posts are
    /// collected or the cursor runs out.
    async fn subreddit_posts(
        &self,
        signal: &Signal,
        name: &str,
        target_posts: usize,
    ) -> Result<Vec<RawPost>, CrawlError>;

    async fn comment_tree(
        &self,
        signal: &Signal,
        post_id: &str,
    ) -> Result<Vec<RawComment>, CrawlError>;

    /// Distinct subreddit names the user was recently active in. Empty
    /// (not an error) when the history is inaccessible.
    async fn user_subreddits(
        &self,
        signal: &Signal,
        username: &str,
    ) -> Result<Vec<String>, CrawlError>;
}

/// Concrete client against the upstream HTTP API.
pub struct ApiClient {
    fetcher: Arc<Fetcher>,
    tokens: Arc<TokenManager>,
    oauth_base: String,
    www_base: String,
    posts_sort: &'static str,
    time_filter: String,
    max_comment_depth: i32,
    max_comments_per_post: usize,
    user_sub_fetch_limit: usize,
}

impl ApiClient {
    pub fn new(cfg: &Config, fetcher: Arc<Fetcher>, tokens: Arc<TokenManager>) -> Self {
        Self {
            fetcher,
            tokens,
            oauth_base: cfg.oauth_base_url.trim_end_matches('/').to_string(),
            www_base: cfg.www_base_url.trim_end_matches('/').to_string(),
            posts_sort: normalize_sort(&cfg.posts_sort),
            time_filter: cfg.posts_time_filter.clone(),
            max_comment_depth: cfg.max_comment_depth,
            max_comments_per_post: cfg.max_comments_per_post,
            user_sub_fetch_limit: cfg.user_sub_fetch_limit,
        }
    }

    pub(super) fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub(super) fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub(super) fn oauth_base(&self) -> &str {
        &self.oauth_base
    }

    pub(super) fn www_base(&self) -> &str {
        &self.www_base
    }

    pub(super) fn user_sub_fetch_limit(&self) -> usize {
        self.user_sub_fetch_limit
    }

    async fn fetch_about(&self, signal: &Signal, name: &str) -> Result<SubredditAbout, CrawlError> {
        let spec = RequestSpec::get(format!("{}/r/{}/about", self.oauth_base, name))
            .query("raw_json", "1");
        let thing: Thing<SubredditAbout> = self
            .fetcher
            .fetch_json(signal, &spec, Some(&self.tokens))
            .await?;
        Ok(thing.data)
    }

    async fn fetch_posts(
        &self,
        signal: &Signal,
        name: &str,
        target_posts: usize,
    ) -> Result<Vec<RawPost>, CrawlError> {
        let mut posts: Vec<RawPost> = Vec::new();
        let mut after: Option<String> = None;
        let mut first_page = true;

        while posts.len() < target_posts {
            if !first_page && !shutdown::sleep(signal, PAGE_DELAY).await {
                return Err(CrawlError::Cancelled);
            }
            first_page = false;

            let limit = (target_posts - posts.len()).min(MAX_PAGE_SIZE);
            let mut spec =
                RequestSpec::get(format!("{}/r/{}/{}", self.oauth_base, name, self.posts_sort))
                    .query("limit", limit.to_string())
                    .query("raw_json", "1");
            if matches!(self.posts_sort, "top" | "controversial") {
                spec = spec.query("t", self.time_filter.clone());
            }
            if let Some(cursor) = &after {
                spec = spec.query("after", cursor.clone());
            }

            let listing: Listing<RawPost> = self
                .fetcher
                .fetch_json(signal, &spec, Some(&self.tokens))
                .await?;

            let page: Vec<RawPost> = listing
                .data
                .children
                .into_iter()
                .filter(|thing| thing.kind == "t3" || thing.kind.is_empty())
                .map(|thing| thing.data)
                .collect();
            debug!(subreddit = name, page_size = page.len(), "listing page fetched");
            if page.is_empty() {
                break;
            }
            posts.extend(page);

            after = listing.data.after.filter(|cursor| !cursor.is_empty());
            if after.is_none() {
                break;
            }
        }

        posts.truncate(target_posts);
        Ok(posts)
    }

    async fn fetch_comment_tree(
        &self,
        signal: &Signal,
        post_id: &str,
    ) -> Result<Vec<RawComment>, CrawlError> {
        let spec = RequestSpec::get(format!("{}/comments/{}", self.oauth_base, post_id))
            .query("limit", self.max_comments_per_post.to_string())
            .query("depth", self.max_comment_depth.to_string())
            .query("raw_json", "1");
        let payload: Vec<Value> = self
            .fetcher
            .fetch_json(signal, &spec, Some(&self.tokens))
            .await?;

        // Element 0 is the post listing, element 1 the comment forest.
        let Some(comment_listing) = payload.get(1) else {
            return Ok(Vec::new());
        };
        Ok(comments::flatten_comment_tree(
            comment_listing,
            self.max_comment_depth,
            self.max_comments_per_post,
        ))
    }
}

#[async_trait]
impl CrawlSource for ApiClient {
    async fn subreddit_about(
        &self,
        signal: &Signal,
        name: &str,
    ) -> Result<SubredditAbout, CrawlError> {
        self.fetch_about(signal, name).await
    }

    async fn subreddit_posts(
        &self,
        signal: &Signal,
        name: &str,
        target_posts: usize,
    ) -> Result<Vec<RawPost>, CrawlError> {
        self.fetch_posts(signal, name, target_posts).await
    }

    async fn comment_tree(
        &self,
        signal: &Signal,
        post_id: &str,
    ) -> Result<Vec<RawComment>, CrawlError> {
        self.fetch_comment_tree(signal, post_id).await
    }

    async fn user_subreddits(
        &self,
        signal: &Signal,
        username: &str,
    ) -> Result<Vec<String>, CrawlError> {
        self.fetch_user_subreddits(signal, username).await
    }
}

/// Clamp the configured sort to the upstream vocabulary.
fn normalize_sort(sort: &str) -> &'static str {
    match sort.to_ascii_lowercase().as_str() {
        "new" => "new",
        "hot" => "hot",
        "top" => "top",
        "rising" => "rising",
        "controversial" => "controversial",
        other => {
            warn!(sort = other, "unknown POSTS_SORT, falling back to top");
            "top"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_normalization() {
        assert_eq!(normalize_sort("new"), "new");
        assert_eq!(normalize_sort("Controversial"), "controversial");
        assert_eq!(normalize_sort("bogus"), "top");
    }
}
