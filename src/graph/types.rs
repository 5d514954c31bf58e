//! Graph node and link types.
//!
//! Node ids are namespaced by type (`user_42`, `subreddit_7`, `post_abc`,
//! `comment_def`) so one table holds every variant and lookups never need
//! a type qualifier.

use sqlx::FromRow;

/// Node variant tag; consumers dispatch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    User,
    Subreddit,
    Post,
    Comment,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::User => "user",
            NodeType::Subreddit => "subreddit",
            NodeType::Post => "post",
            NodeType::Comment => "comment",
        }
    }

    /// Namespaced node id for a raw entity id.
    pub fn node_id(&self, raw: impl std::fmt::Display) -> String {
        format!("{}_{raw}", self.as_str())
    }
}

/// A node ready for upsert. Position is owned by the layouter and is
/// never written by the builder; it only reads it back for centroids.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub val: f64,
    pub node_type: NodeType,
}

impl GraphNode {
    pub fn new(node_type: NodeType, raw_id: impl std::fmt::Display, name: &str, val: f64) -> Self {
        Self {
            id: node_type.node_id(raw_id),
            name: truncate_runes(name, MAX_NAME_RUNES),
            val,
            node_type,
        }
    }
}

/// Directed link between two node ids. Duplicates are forbidden by the
/// table's primary key and by the builder's in-memory dedup set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphLink {
    pub source: String,
    pub target: String,
}

/// One row of `graph_nodes` as stored.
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: String,
    pub name: String,
    pub val: f64,
    pub node_type: String,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl NodeRow {
    pub fn position(&self) -> Option<(f64, f64, f64)> {
        match (self.x, self.y, self.z) {
            (Some(x), Some(y), Some(z)) => Some((x, y, z)),
            _ => None,
        }
    }
}

/// Display names are capped at this many runes.
pub const MAX_NAME_RUNES: usize = 256;

/// Truncate to at most `max` characters, never splitting a code point.
pub fn truncate_runes(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn node_ids_are_namespaced() {
        assert_eq!(NodeType::User.node_id(42), "user_42");
        assert_eq!(NodeType::Subreddit.node_id(7), "subreddit_7");
        assert_eq!(NodeType::Post.node_id("abc"), "post_abc");
        assert_eq!(NodeType::Comment.node_id("def"), "comment_def");
    }

    #[test]
    fn truncation_counts_runes_not_bytes() {
        let text = "é".repeat(300);
        let cut = truncate_runes(&text, 256);
        assert_eq!(cut.chars().count(), 256);
    }

    proptest! {
        #[test]
        fn truncation_is_utf8_safe_and_bounded(text in ".*", max in 0usize..300) {
            let cut = truncate_runes(&text, max);
            prop_assert!(cut.chars().count() <= max);
            // Any prefix relationship must hold at the char level.
            prop_assert!(text.starts_with(&cut));
        }
    }
}
