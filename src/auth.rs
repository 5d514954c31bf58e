//! OAuth token lifecycle.
//!
//! A single in-memory `(access_token, expiry)` pair guarded by a
//! reader-writer lock. Readers take the fast path while the token has more
//! than a minute of life left; the first caller to find it stale takes the
//! write lock, re-checks, and refreshes; concurrent callers piggyback on
//! that one refresh. Credential rotation swaps the pair under the same
//! lock and rolls back if the new credentials cannot mint a token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{mask, Config, Credentials};
use crate::error::CrawlError;
use crate::http::{Fetcher, RequestSpec};
use crate::shutdown::{self, Signal};

/// Life left under which a reader refuses the cached token.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);
/// Sleep between refresh-loop attempts when no expiry is known yet.
const RETRY_NAP: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug)]
struct AuthState {
    client_id: String,
    client_secret: String,
    access_token: String,
    expires_at: Option<Instant>,
}

impl AuthState {
    fn usable(&self) -> bool {
        !self.access_token.is_empty()
            && self
                .expires_at
                .map(|at| Instant::now() + EXPIRY_SLACK < at)
                .unwrap_or(false)
    }
}

/// Manages the process-wide access token and its credentials.
#[derive(Debug)]
pub struct TokenManager {
    fetcher: Arc<Fetcher>,
    token_url: String,
    state: RwLock<AuthState>,
    /// Set by the fetch layer on a 401; forces the next `bearer()` through
    /// the refresh path even if the local expiry still looks fine.
    expired: AtomicBool,
}

impl TokenManager {
    pub fn new(cfg: &Config, fetcher: Arc<Fetcher>) -> Result<Self, CrawlError> {
        let Credentials {
            client_id,
            client_secret,
        } = cfg.credentials.clone();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(CrawlError::Config(
                "token manager requires client credentials".to_string(),
            ));
        }
        Ok(Self {
            fetcher,
            token_url: format!("{}/api/v1/access_token", cfg.www_base_url),
            state: RwLock::new(AuthState {
                client_id,
                client_secret,
                access_token: String::new(),
                expires_at: None,
            }),
            expired: AtomicBool::new(false),
        })
    }

    /// A valid bearer token, refreshing if needed. Single-flight: only one
    /// caller refreshes, the rest block on the write lock and re-check.
    pub async fn bearer(&self, signal: &Signal) -> Result<String, CrawlError> {
        {
            let state = self.state.read().await;
            if !self.expired.load(Ordering::Relaxed) && state.usable() {
                return Ok(state.access_token.clone());
            }
        }

        let mut state = self.state.write().await;
        // Double-check: a concurrent writer may have refreshed while we
        // waited on the lock.
        if !self.expired.load(Ordering::Relaxed) && state.usable() {
            return Ok(state.access_token.clone());
        }
        self.refresh_locked(&mut state, signal).await?;
        self.expired.store(false, Ordering::Relaxed);
        Ok(state.access_token.clone())
    }

    /// Mark the cached token bad (called on upstream 401). Sync so the
    /// fetch layer can flag it without awaiting the state lock.
    pub fn invalidate(&self) {
        self.expired.store(true, Ordering::Relaxed);
    }

    /// Swap credentials. Refreshes immediately with the new pair; on
    /// failure the old credentials and token are restored and the error
    /// returned.
    pub async fn rotate(
        &self,
        new_id: String,
        new_secret: String,
        signal: &Signal,
    ) -> Result<(), CrawlError> {
        let mut state = self.state.write().await;
        let old_id = std::mem::replace(&mut state.client_id, new_id);
        let old_secret = std::mem::replace(&mut state.client_secret, new_secret);
        let old_token = state.access_token.clone();
        let old_expiry = state.expires_at;

        match self.refresh_locked(&mut state, signal).await {
            Ok(()) => {
                info!(client_id = %mask(&state.client_id), "credentials rotated");
                self.expired.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                warn!(
                    client_id = %mask(&old_id),
                    error = %err,
                    "rotation refresh failed, rolling back credentials"
                );
                state.client_id = old_id;
                state.client_secret = old_secret;
                state.access_token = old_token;
                state.expires_at = old_expiry;
                Err(err)
            }
        }
    }

    /// Keep the token fresh ahead of demand. Runs until shutdown; wakes at
    /// the stored expiry (which already carries the refresh offset).
    pub async fn run_refresh_loop(self: Arc<Self>, signal: Signal) {
        loop {
            if shutdown::is_triggered(&signal) {
                return;
            }
            match self.bearer(&signal).await {
                Ok(_) => {}
                Err(CrawlError::Cancelled) => return,
                Err(err) => warn!(error = %err, "proactive token refresh failed"),
            }

            let nap = {
                let state = self.state.read().await;
                state
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(RETRY_NAP)
            }
            .max(Duration::from_secs(5));

            if !shutdown::sleep(&signal, nap).await {
                return;
            }
        }
    }

    /// POST the token endpoint with the current credentials. Caller holds
    /// the write lock.
    async fn refresh_locked(
        &self,
        state: &mut AuthState,
        signal: &Signal,
    ) -> Result<(), CrawlError> {
        let spec = RequestSpec::post(self.token_url.clone())
            .form(vec![
                ("grant_type".to_string(), "client_credentials".to_string()),
                ("scope".to_string(), "read".to_string()),
            ])
            .basic_auth(state.client_id.clone(), state.client_secret.clone());

        let response: TokenResponse = self.fetcher.fetch_json(signal, &spec, None).await?;
        if response.access_token.is_empty() {
            return Err(CrawlError::Decode(
                "token endpoint returned no access_token".to_string(),
            ));
        }

        let offset = refresh_offset(response.expires_in);
        state.access_token = response.access_token;
        state.expires_at = Some(Instant::now() + offset);
        counter!("token_refreshes").increment(1);
        info!(
            client_id = %mask(&state.client_id),
            token = %mask(&state.access_token),
            expires_in = response.expires_in,
            refresh_in_secs = offset.as_secs(),
            "access token refreshed"
        );
        Ok(())
    }
}

/// How long a freshly minted token is trusted: `expires_in − 60s`, or half
/// the lifetime when that slack would leave 120s or less.
fn refresh_offset(expires_in: u64) -> Duration {
    let slacked = expires_in.saturating_sub(60);
    if slacked <= 120 {
        Duration::from_secs(expires_in / 2)
    } else {
        Duration::from_secs(slacked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateBucket;

    fn manager() -> TokenManager {
        let cfg = Config {
            credentials: Credentials {
                client_id: "test-client".to_string(),
                client_secret: "test-secret".to_string(),
            },
            ..Config::default()
        };
        let fetcher = Arc::new(Fetcher::new(&cfg, Arc::new(RateBucket::new(100, 100))).unwrap());
        TokenManager::new(&cfg, fetcher).unwrap()
    }

    #[test]
    fn refresh_offset_keeps_a_minute_of_slack() {
        assert_eq!(refresh_offset(3600), Duration::from_secs(3540));
    }

    #[test]
    fn refresh_offset_halves_short_lifetimes() {
        // 150s − 60s = 90s ≤ 120s, so fall back to half the lifetime.
        assert_eq!(refresh_offset(150), Duration::from_secs(75));
        assert_eq!(refresh_offset(60), Duration::from_secs(30));
        assert_eq!(refresh_offset(0), Duration::from_secs(0));
    }

    #[test]
    fn missing_credentials_are_a_config_error() {
        let cfg = Config::default();
        let fetcher = Arc::new(Fetcher::new(&cfg, Arc::new(RateBucket::new(1, 1))).unwrap());
        let err = TokenManager::new(&cfg, fetcher).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn empty_state_is_not_usable() {
        let manager = manager();
        let state = manager.state.read().await;
        assert!(!state.usable());
    }

    #[tokio::test]
    async fn invalidate_forces_the_slow_path() {
        let manager = manager();
        {
            let mut state = manager.state.write().await;
            state.access_token = "tok".to_string();
            state.expires_at = Some(Instant::now() + Duration::from_secs(600));
            assert!(state.usable());
        }
        manager.invalidate();
        assert!(manager.expired.load(Ordering::Relaxed));
    }
}
