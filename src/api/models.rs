//! Upstream listing envelopes.
//!
//! Everything upstream returns is shaped `{kind, data}` with listings
//! wrapped as `{data: {children: [...], after}}`. Unknown fields are
//! ignored throughout; absent fields default.

use serde::Deserialize;

/// `{data: {children, after}}` wrapper around any payload type.
#[derive(Debug, Clone, Deserialize)]
pub struct Listing<T> {
    pub data: ListingData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingData<T> {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default = "Vec::new")]
    pub children: Vec<Thing<T>>,
}

/// A single `{kind, data}` element.
#[derive(Debug, Clone, Deserialize)]
pub struct Thing<T> {
    #[serde(default)]
    pub kind: String,
    pub data: T,
}

/// `/r/<name>/about` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubredditAbout {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub public_description: String,
    #[serde(default)]
    pub subscribers: i64,
}

/// A post as returned by listing endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPost {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub created_utc: f64,
}

/// An overview/search item; only the subreddit attribution matters for
/// user-history discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct SubredditRef {
    #[serde(default)]
    pub subreddit: String,
}

/// A comment flattened out of the nested reply tree.
#[derive(Debug, Clone)]
pub struct RawComment {
    pub id: String,
    pub author: String,
    pub body: String,
    /// Fullname of the parent: `t1_<comment>` or `t3_<post>`.
    pub parent_id: Option<String>,
    pub depth: i32,
    pub score: i64,
    pub created_utc: f64,
}
