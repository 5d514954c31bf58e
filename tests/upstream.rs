//! End-to-end tests of the fetch pipeline against an in-process HTTP stub:
//! token lifecycle (single-flight refresh, rotation rollback, 401 retry)
//! and the typed API operations (about, pagination, comment trees, user
//! history fallbacks).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crowdmap::api::{ApiClient, CrawlSource};
use crowdmap::auth::TokenManager;
use crowdmap::config::{Config, Credentials};
use crowdmap::http::Fetcher;
use crowdmap::ratelimit::RateBucket;
use crowdmap::shutdown;

// ── HTTP stub ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StubRequest {
    method: String,
    target: String,
    authorization: Option<String>,
}

type RouteFn = dyn Fn(&StubRequest) -> (u16, String) + Send + Sync;

struct StubServer {
    base_url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl StubServer {
    async fn start(routes: Arc<RouteFn>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let requests: Arc<Mutex<Vec<StubRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, routes, log).await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
        }
    }

    fn hits(&self, path_prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.target.starts_with(path_prefix))
            .count()
    }
}

async fn serve_one(
    mut stream: TcpStream,
    routes: Arc<RouteFn>,
    log: Arc<Mutex<Vec<StubRequest>>>,
) -> std::io::Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut authorization = None;
    let mut content_length = 0usize;
    for line in lines {
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
        if lower.starts_with("authorization:") {
            authorization = Some(line.splitn(2, ':').nth(1).unwrap_or("").trim().to_string());
        }
    }

    // Drain the body so the client never sees a reset mid-send.
    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request = StubRequest {
        method,
        target,
        authorization,
    };
    log.lock().unwrap().push(request.clone());

    let (status, body) = routes(&request);
    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── fixtures ────────────────────────────────────────────────────────────

fn test_config(base_url: &str) -> Config {
    Config {
        credentials: Credentials {
            client_id: "stub-client".to_string(),
            client_secret: "stub-secret".to_string(),
        },
        oauth_base_url: base_url.to_string(),
        www_base_url: base_url.to_string(),
        rps: 1000,
        burst_size: 1000,
        http_max_attempts: 2,
        posts_sort: "top".to_string(),
        posts_time_filter: "all".to_string(),
        ..Config::default()
    }
}

fn pipeline(cfg: &Config) -> (Arc<Fetcher>, Arc<TokenManager>) {
    let bucket = Arc::new(RateBucket::new(cfg.rps, cfg.burst_size));
    let fetcher = Arc::new(Fetcher::new(cfg, bucket).expect("fetcher"));
    let tokens = Arc::new(TokenManager::new(cfg, fetcher.clone()).expect("token manager"));
    (fetcher, tokens)
}

fn token_body(token: &str) -> String {
    format!(r#"{{"access_token": "{token}", "expires_in": 3600}}"#)
}

fn posts_page(ids: &[&str], after: &str) -> String {
    let children: Vec<String> = ids
        .iter()
        .map(|id| {
            format!(
                r#"{{"kind": "t3", "data": {{"id": "{id}", "title": "post {id}",
                     "author": "author_{id}", "score": 10, "url": "", "is_self": true,
                     "created_utc": 1700000000.0, "selftext": ""}}}}"#
            )
        })
        .collect();
    format!(
        r#"{{"kind": "Listing", "data": {{"after": "{after}", "children": [{}]}}}}"#,
        children.join(",")
    )
}

// ── token lifecycle ─────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_bearer_calls_share_one_refresh() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();
    let routes: Arc<RouteFn> = Arc::new(move |req| {
        if req.target.starts_with("/api/v1/access_token") {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (200, token_body(&format!("tok-{n}")))
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (_fetcher, tokens) = pipeline(&cfg);
    let (_tx, signal) = shutdown::channel();

    let calls = (0..10).map(|_| {
        let tokens = tokens.clone();
        let signal = signal.clone();
        tokio::spawn(async move { tokens.bearer(&signal).await })
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap(), "tok-1");
    }
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rotation_rolls_back_on_refresh_failure() {
    let routes: Arc<RouteFn> = Arc::new(|req| {
        if req.target.starts_with("/api/v1/access_token") {
            // Only the original credentials mint tokens.
            match &req.authorization {
                Some(auth) if auth.starts_with("Basic ") => {
                    let encoded = auth.trim_start_matches("Basic ").to_string();
                    // "stub-client:stub-secret" in base64.
                    if encoded == "c3R1Yi1jbGllbnQ6c3R1Yi1zZWNyZXQ=" {
                        (200, token_body("tok-good"))
                    } else {
                        (401, r#"{"error": "invalid_client"}"#.to_string())
                    }
                }
                _ => (401, String::new()),
            }
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (_fetcher, tokens) = pipeline(&cfg);
    let (_tx, signal) = shutdown::channel();

    assert_eq!(tokens.bearer(&signal).await.unwrap(), "tok-good");

    let err = tokens
        .rotate("bad-client".to_string(), "bad-secret".to_string(), &signal)
        .await
        .unwrap_err();
    assert!(err.retryable(), "401 from the token endpoint retries first");

    // Old credentials still work after the rollback.
    assert_eq!(tokens.bearer(&signal).await.unwrap(), "tok-good");
}

#[tokio::test]
async fn unauthorized_listing_triggers_token_refresh_and_retry() {
    let tokens_minted = Arc::new(AtomicUsize::new(0));
    let minted = tokens_minted.clone();
    let routes: Arc<RouteFn> = Arc::new(move |req| {
        if req.target.starts_with("/api/v1/access_token") {
            let n = minted.fetch_add(1, Ordering::SeqCst) + 1;
            (200, token_body(&format!("tok-{n}")))
        } else if req.target.starts_with("/r/test/about") {
            // The first minted token is always rejected.
            match req.authorization.as_deref() {
                Some("Bearer tok-1") => (401, String::new()),
                Some(_) => (
                    200,
                    r#"{"kind": "t5", "data": {"display_name": "test",
                        "title": "t", "public_description": "", "subscribers": 1}}"#
                        .to_string(),
                ),
                None => (401, String::new()),
            }
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (fetcher, tokens) = pipeline(&cfg);
    let client = ApiClient::new(&cfg, fetcher, tokens);
    let (_tx, signal) = shutdown::channel();

    let about = client.subreddit_about(&signal, "test").await.unwrap();
    assert_eq!(about.subscribers, 1);
    assert_eq!(tokens_minted.load(Ordering::SeqCst), 2);
}

// ── API operations ──────────────────────────────────────────────────────

#[tokio::test]
async fn pagination_follows_the_after_cursor() {
    let routes: Arc<RouteFn> = Arc::new(|req| {
        if req.target.starts_with("/api/v1/access_token") {
            (200, token_body("tok"))
        } else if req.target.starts_with("/r/test/about") {
            (
                200,
                r#"{"kind": "t5", "data": {"display_name": "test", "title": "t",
                    "public_description": "", "subscribers": 1}}"#
                    .to_string(),
            )
        } else if req.target.starts_with("/r/test/top") {
            if req.target.contains("after=t3_after") {
                (200, posts_page(&["p3"], ""))
            } else {
                (200, posts_page(&["p1", "p2"], "t3_after"))
            }
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (fetcher, tokens) = pipeline(&cfg);
    let client = ApiClient::new(&cfg, fetcher, tokens);
    let (_tx, signal) = shutdown::channel();

    let about = client.subreddit_about(&signal, "test").await.unwrap();
    assert_eq!(about.title, "t");
    assert_eq!(about.subscribers, 1);

    let posts = client.subreddit_posts(&signal, "test", 3).await.unwrap();
    let ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);
    assert_eq!(server.hits("/r/test/top"), 2);
}

#[tokio::test]
async fn pagination_stops_when_the_cursor_runs_out() {
    let routes: Arc<RouteFn> = Arc::new(|req| {
        if req.target.starts_with("/api/v1/access_token") {
            (200, token_body("tok"))
        } else if req.target.starts_with("/r/small/top") {
            (200, posts_page(&["only"], ""))
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (fetcher, tokens) = pipeline(&cfg);
    let client = ApiClient::new(&cfg, fetcher, tokens);
    let (_tx, signal) = shutdown::channel();

    let posts = client.subreddit_posts(&signal, "small", 50).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(server.hits("/r/small/top"), 1);
}

#[tokio::test]
async fn comment_trees_flatten_with_depth_and_parents() {
    let routes: Arc<RouteFn> = Arc::new(|req| {
        if req.target.starts_with("/api/v1/access_token") {
            (200, token_body("tok"))
        } else if req.target.starts_with("/comments/p1") {
            let body = r#"[
                {"kind": "Listing", "data": {"children": []}},
                {"kind": "Listing", "data": {"children": [
                    {"kind": "t1", "data": {"id": "c1", "author": "alice",
                     "body": "top", "parent_id": "t3_p1", "score": 5,
                     "created_utc": 1700000000.0,
                     "replies": {"kind": "Listing", "data": {"children": [
                        {"kind": "t1", "data": {"id": "c2", "author": "[deleted]",
                         "body": "gone", "parent_id": "t1_c1", "score": 1,
                         "created_utc": 1700000001.0, "replies": ""}}
                     ]}}}}
                ]}}
            ]"#;
            (200, body.to_string())
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (fetcher, tokens) = pipeline(&cfg);
    let client = ApiClient::new(&cfg, fetcher, tokens);
    let (_tx, signal) = shutdown::channel();

    let comments = client.comment_tree(&signal, "p1").await.unwrap();
    assert_eq!(comments.len(), 1, "deleted author filtered");
    assert_eq!(comments[0].id, "c1");
    assert_eq!(comments[0].parent_id.as_deref(), Some("t3_p1"));
}

#[tokio::test]
async fn user_history_falls_back_through_strategies() {
    let routes: Arc<RouteFn> = Arc::new(|req| {
        if req.target.starts_with("/api/v1/access_token") {
            (200, token_body("tok"))
        } else if req.target.starts_with("/user/ghost/overview") {
            (403, String::new())
        } else if req.target.starts_with("/search") {
            (404, String::new())
        } else if req.target.starts_with("/user/ghost.json") {
            let body = r#"{"kind": "Listing", "data": {"children": [
                {"kind": "t1", "data": {"subreddit": "Rust"}},
                {"kind": "t3", "data": {"subreddit": "rust"}},
                {"kind": "t1", "data": {"subreddit": "golang"}}
            ]}}"#;
            (200, body.to_string())
        } else {
            (404, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (fetcher, tokens) = pipeline(&cfg);
    let client = ApiClient::new(&cfg, fetcher, tokens);
    let (_tx, signal) = shutdown::channel();

    let subs = client.user_subreddits(&signal, "ghost").await.unwrap();
    assert_eq!(subs, vec!["Rust", "golang"]);
    // The public fallback must not carry the bearer token.
    let public = server
        .requests
        .lock()
        .unwrap()
        .iter()
        .find(|r| r.target.starts_with("/user/ghost.json"))
        .cloned()
        .unwrap();
    assert!(public.authorization.is_none());
    assert_eq!(public.method, "GET");
}

#[tokio::test]
async fn user_history_denied_everywhere_is_an_empty_set() {
    let routes: Arc<RouteFn> = Arc::new(|req| {
        if req.target.starts_with("/api/v1/access_token") {
            (200, token_body("tok"))
        } else {
            (403, String::new())
        }
    });
    let server = StubServer::start(routes).await;

    let cfg = test_config(&server.base_url);
    let (fetcher, tokens) = pipeline(&cfg);
    let client = ApiClient::new(&cfg, fetcher, tokens);
    let (_tx, signal) = shutdown::channel();

    let subs = client.user_subreddits(&signal, "nobody").await.unwrap();
    assert!(subs.is_empty());
}
