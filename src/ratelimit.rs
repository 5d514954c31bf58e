//! Global request pacing.
//!
//! A single token bucket fronts every outbound HTTP attempt: listings,
//! comment trees, user history, and the token endpoint alike. Workers share
//! one bucket so the process as a whole honors the configured rate no
//! matter how many jobs are in flight.

use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use metrics::counter;

use crate::error::CrawlError;
use crate::shutdown::{self, Signal};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Process-wide token bucket with a configured sustained rate and burst.
pub struct RateBucket {
    limiter: DirectLimiter,
    rps: u32,
    burst: u32,
}

impl RateBucket {
    pub fn new(rps: u32, burst: u32) -> Self {
        let rps = rps.max(1);
        let burst = burst.max(1);
        let quota = Quota::per_second(NonZeroU32::new(rps).expect("rps clamped to >= 1"))
            .allow_burst(NonZeroU32::new(burst).expect("burst clamped to >= 1"));
        Self {
            limiter: RateLimiter::direct(quota),
            rps,
            burst,
        }
    }

    /// Block until a token is available or shutdown is signalled.
    ///
    /// Every outbound attempt, retries and token-endpoint posts included,
    /// must pass through here before touching the network.
    pub async fn wait(&self, signal: &Signal) -> Result<(), CrawlError> {
        if shutdown::is_triggered(signal) {
            return Err(CrawlError::Cancelled);
        }
        if self.limiter.check().is_ok() {
            return Ok(());
        }
        counter!("rate_limit_waits").increment(1);
        tokio::select! {
            _ = self.limiter.until_ready() => Ok(()),
            _ = shutdown::triggered(signal) => Err(CrawlError::Cancelled),
        }
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

impl std::fmt::Debug for RateBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateBucket")
            .field("rps", &self.rps)
            .field("burst", &self.burst)
            .finish()
    }
}

static GLOBAL: RwLock<Option<Arc<RateBucket>>> = RwLock::new(None);

/// Install the process-wide bucket. Called once by the daemon; later calls
/// replace the bucket (used by tests via [`reset_global`]).
pub fn install_global(bucket: Arc<RateBucket>) {
    *GLOBAL.write().expect("rate bucket lock poisoned") = Some(bucket);
}

/// The installed process-wide bucket, if any. Library code takes the bucket
/// by `Arc` in constructors; this accessor exists for wiring code only.
pub fn global() -> Option<Arc<RateBucket>> {
    GLOBAL.read().expect("rate bucket lock poisoned").clone()
}

/// Drop the installed bucket. Test hook.
pub fn reset_global() {
    *GLOBAL.write().expect("rate bucket lock poisoned") = None;
}
