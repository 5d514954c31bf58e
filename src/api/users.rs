//! User-history discovery strategies.
//!
//! Three fallbacks, tried in order: the OAuth overview listing, the OAuth
//! author search, and finally the unauthenticated public listing. Access
//! denials (401/403/404 family) move on to the next strategy; when every
//! strategy is denied the result is an empty set, not an error.

use tracing::debug;

use super::models::{Listing, SubredditRef};
use super::ApiClient;
use crate::error::CrawlError;
use crate::http::RequestSpec;
use crate::shutdown::Signal;

impl ApiClient {
    pub(super) async fn fetch_user_subreddits(
        &self,
        signal: &Signal,
        username: &str,
    ) -> Result<Vec<String>, CrawlError> {
        let limit = self.user_sub_fetch_limit();

        let overview = RequestSpec::get(format!(
            "{}/user/{}/overview",
            self.oauth_base(),
            username
        ))
        .query("limit", limit.to_string())
        .query("raw_json", "1");

        let author_search = RequestSpec::get(format!("{}/search", self.oauth_base()))
            .query("q", format!("author:{username}"))
            .query("type", "link")
            .query("limit", limit.to_string())
            .query("raw_json", "1");

        let public = RequestSpec::get(format!("{}/user/{}.json", self.www_base(), username))
            .query("limit", limit.to_string())
            .query("raw_json", "1");

        for (strategy, spec, authenticated) in [
            ("overview", overview, true),
            ("author_search", author_search, true),
            ("public_listing", public, false),
        ] {
            let tokens = authenticated.then(|| self.tokens());
            match self
                .fetcher()
                .fetch_json::<Listing<SubredditRef>>(signal, &spec, tokens)
                .await
            {
                Ok(listing) => {
                    let names = dedup_names(
                        listing
                            .data
                            .children
                            .into_iter()
                            .map(|thing| thing.data.subreddit),
                        limit,
                    );
                    if !names.is_empty() {
                        debug!(username, strategy, count = names.len(), "user history resolved");
                        return Ok(names);
                    }
                }
                Err(err) if err.is_access_denied() => {
                    debug!(username, strategy, kind = err.kind(), "strategy denied, trying next");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Vec::new())
    }
}

/// Case-insensitive dedup keeping the first-seen casing, capped at `limit`.
fn dedup_names(names: impl Iterator<Item = String>, limit: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for name in names {
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.to_lowercase()) {
            out.push(name);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_seen_casing() {
        let names = ["Rust", "rust", "RUST", "golang"]
            .iter()
            .map(|s| s.to_string());
        assert_eq!(dedup_names(names, 10), vec!["Rust", "golang"]);
    }

    #[test]
    fn dedup_applies_the_cap() {
        let names = (0..20).map(|i| format!("sub{i}"));
        assert_eq!(dedup_names(names, 3).len(), 3);
    }

    #[test]
    fn dedup_drops_empty_names() {
        let names = ["", "rust"].iter().map(|s| s.to_string());
        assert_eq!(dedup_names(names, 10), vec!["rust"]);
    }
}
