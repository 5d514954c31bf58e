//! crowdmap: incremental crawler and community-graph builder for
//! Reddit-style sites.
//!
//! Three subsystems built around one Postgres pool:
//!
//! - a durable crawl-job queue (`queue`) drained by parallel workers
//!   (`worker`) that fetch through an OAuth-paced HTTP pipeline
//!   (`ratelimit` → `auth` → `http` → `api`) and persist via idempotent
//!   upserts (`database`);
//! - frontier discovery (`worker::discovery`) feeding the queue from
//!   mentions and author histories;
//! - a periodic graph precompute (`graph`) that materializes nodes and
//!   links, detects Louvain communities hierarchically, and versions each
//!   snapshot with diffs.

pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod http;
pub mod queue;
pub mod ratelimit;
pub mod shutdown;
pub mod worker;

pub use config::Config;
pub use error::CrawlError;
