//! Frontier discovery: subreddit mentions in post text, and the recent
//! haunts of comment authors.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::api::{CrawlSource, RawPost};
use crate::database::SubredditStore;
use crate::error::CrawlError;
use crate::queue::JobQueue;
use crate::shutdown::Signal;

static MENTION_RE: OnceLock<Regex> = OnceLock::new();

fn mention_regex() -> &'static Regex {
    MENTION_RE.get_or_init(|| Regex::new(r"(?i)/r/([A-Za-z0-9_]+)").expect("static regex"))
}

/// Pull `/r/<name>` mentions out of free text. Case-insensitively unique;
/// the first-seen casing is the one returned.
pub fn extract_mentions<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for text in texts {
        for capture in mention_regex().captures_iter(text) {
            let name = capture[1].to_string();
            if seen.insert(name.to_lowercase()) {
                out.push(name);
            }
        }
    }
    out
}

/// Authors whose history was already fetched this process. Thread-safe;
/// injectable so tests can reset it.
#[derive(Default)]
pub struct SeenUsers {
    inner: Mutex<HashSet<String>>,
}

impl SeenUsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per username per process.
    pub fn first_sighting(&self, username: &str) -> bool {
        self.inner
            .lock()
            .expect("seen-users lock poisoned")
            .insert(username.to_lowercase())
    }

    /// Test hook.
    pub fn reset(&self) {
        self.inner.lock().expect("seen-users lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("seen-users lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns crawled content into new queue entries.
pub struct Discovery {
    queue: Arc<JobQueue>,
    subreddits: SubredditStore,
    seen_users: Arc<SeenUsers>,
    fetch_user_subreddits: bool,
    enqueue_max: usize,
}

impl Discovery {
    pub fn new(
        queue: Arc<JobQueue>,
        subreddits: SubredditStore,
        seen_users: Arc<SeenUsers>,
        fetch_user_subreddits: bool,
        enqueue_max: usize,
    ) -> Self {
        Self {
            queue,
            subreddits,
            seen_users,
            fetch_user_subreddits,
            enqueue_max,
        }
    }

    /// Enqueue every subreddit mentioned in the posts' titles and
    /// self-texts. Returns how many new jobs were created.
    pub async fn enqueue_mentions(&self, posts: &[RawPost]) -> Result<usize, CrawlError> {
        let texts = posts
            .iter()
            .flat_map(|p| [p.title.as_str(), p.selftext.as_str()]);
        let mentions = extract_mentions(texts);
        let mut enqueued = 0;
        for name in &mentions {
            let id = self.subreddits.ensure(name).await?;
            if self.queue.enqueue(id, "mention").await? {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            debug!(enqueued, "mention discovery enqueued jobs");
        }
        Ok(enqueued)
    }

    /// Fetch a comment author's recent subreddits (at most once per
    /// process) and enqueue up to the configured cap.
    pub async fn discover_author(
        &self,
        signal: &Signal,
        source: &dyn CrawlSource,
        author: &str,
    ) -> Result<usize, CrawlError> {
        if !self.fetch_user_subreddits {
            return Ok(0);
        }
        if author.is_empty() || author == "[deleted]" {
            return Ok(0);
        }
        if !self.seen_users.first_sighting(author) {
            return Ok(0);
        }

        let names = source.user_subreddits(signal, author).await?;
        let mut enqueued = 0;
        for name in names.iter().take(self.enqueue_max) {
            let id = match self.subreddits.ensure(name).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(subreddit = %name, error = %err, "skipping discovered subreddit");
                    continue;
                }
            };
            if self.queue.enqueue(id, "user-history").await? {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            debug!(author, enqueued, "author discovery enqueued jobs");
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_matches_the_documented_scenario() {
        let texts = [
            "Check /r/Golang and /r/programming",
            "see /r/golang for more",
            "/r/GoLang duplicate",
        ];
        let mentions = extract_mentions(texts);
        assert_eq!(mentions, vec!["Golang", "programming"]);
    }

    #[test]
    fn extraction_is_case_insensitive_on_the_marker() {
        let mentions = extract_mentions(["try /R/Rust today"]);
        assert_eq!(mentions, vec!["Rust"]);
    }

    #[test]
    fn extracted_names_match_the_mention_charset() {
        let name_re = Regex::new(r"^[A-Za-z0-9_]+$").unwrap();
        let mentions = extract_mentions([
            "/r/foo-bar /r/ok_name /r/trailing. punctuation /r/123abc",
            "no mentions here, r/not_a_slash_mention",
        ]);
        assert!(!mentions.is_empty());
        for name in &mentions {
            assert!(name_re.is_match(name), "bad mention {name:?}");
        }
        // The hyphenated form only matches its leading segment.
        assert!(mentions.iter().any(|m| m == "foo"));
        assert!(mentions.iter().any(|m| m == "ok_name"));
    }

    #[test]
    fn seen_users_admit_each_name_once() {
        let seen = SeenUsers::new();
        assert!(seen.first_sighting("alice"));
        assert!(!seen.first_sighting("alice"));
        assert!(!seen.first_sighting("ALICE"));
        assert!(seen.first_sighting("bob"));
        assert_eq!(seen.len(), 2);

        seen.reset();
        assert!(seen.first_sighting("alice"));
    }

    #[test]
    fn seen_users_is_safe_under_contention() {
        let seen = Arc::new(SeenUsers::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seen = seen.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).filter(|i| seen.first_sighting(&format!("user{i}"))).count()
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}
