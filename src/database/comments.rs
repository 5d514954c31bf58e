//! Comment rows with two-pass insertion.
//!
//! Parents may be the post (`t3_…`) or another comment (`t1_…`), and
//! upstream ordering does not guarantee parents before children. Pass 1
//! takes everything whose parent is the post or already taken; pass 2
//! sweeps the stragglers whose parent arrived during pass 1; whatever is
//! still orphaned (parent filtered out or outside the fetch window) is
//! reparented to the post so no row ever references a missing parent.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

use crate::error::CrawlError;

#[derive(Debug, Clone)]
pub struct NewComment {
    pub id: String,
    pub post_id: String,
    pub subreddit_id: i32,
    pub author_id: Option<i32>,
    pub body: String,
    /// Fullname of the parent (`t1_<comment>` or `t3_<post>`).
    pub parent_id: Option<String>,
    pub depth: i32,
    pub score: i64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct CommentStore {
    pool: PgPool,
}

impl CommentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a post's comments in dependency order. Per-row failures are
    /// logged and skipped; the rest of the tree still lands.
    pub async fn insert_tree(
        &self,
        post_id: &str,
        comments: Vec<NewComment>,
    ) -> Result<usize, CrawlError> {
        let ordered = plan_insertion_order(post_id, comments);
        let mut inserted = 0usize;
        for comment in &ordered {
            match self.upsert(comment).await {
                Ok(()) => inserted += 1,
                Err(err) => {
                    warn!(
                        comment_id = %comment.id,
                        post_id,
                        error = %err,
                        "skipping comment row"
                    );
                }
            }
        }
        Ok(inserted)
    }

    async fn upsert(&self, comment: &NewComment) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO comments \
                 (id, post_id, subreddit_id, author_id, body, parent_id, depth, score, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
                 score = EXCLUDED.score, \
                 body = EXCLUDED.body",
        )
        .bind(&comment.id)
        .bind(&comment.post_id)
        .bind(comment.subreddit_id)
        .bind(comment.author_id)
        .bind(&comment.body)
        .bind(&comment.parent_id)
        .bind(comment.depth)
        .bind(comment.score)
        .bind(comment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// First comments of a post in thread order, for the detailed graph.
    pub async fn first_for_post(
        &self,
        post_id: &str,
        limit: i64,
    ) -> Result<Vec<(String, Option<String>, Option<i32>, String, i64)>, CrawlError> {
        let rows: Vec<(String, Option<String>, Option<i32>, String, i64)> = sqlx::query_as(
            "SELECT id, parent_id, author_id, body, score FROM comments \
             WHERE post_id = $1 \
             ORDER BY depth ASC, id ASC \
             LIMIT $2",
        )
        .bind(post_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Order comments so every row's parent is already present, reparenting
/// irreducible orphans to the post.
pub fn plan_insertion_order(post_id: &str, comments: Vec<NewComment>) -> Vec<NewComment> {
    let post_fullname = format!("t3_{post_id}");
    let mut placed: HashSet<String> = HashSet::new();
    let mut ordered: Vec<NewComment> = Vec::with_capacity(comments.len());
    let mut pending: Vec<NewComment> = Vec::new();

    // Pass 1: parent is the post, absent, or a comment taken earlier in
    // this same pass.
    for comment in comments {
        if parent_satisfied(&comment, &post_fullname, &placed) {
            placed.insert(comment.id.clone());
            ordered.push(comment);
        } else {
            pending.push(comment);
        }
    }

    // Pass 2: parents that showed up during pass 1.
    let mut orphans: Vec<NewComment> = Vec::new();
    for comment in pending {
        if parent_satisfied(&comment, &post_fullname, &placed) {
            placed.insert(comment.id.clone());
            ordered.push(comment);
        } else {
            orphans.push(comment);
        }
    }

    // Whatever is left points at a parent we will never have: hang it off
    // the post directly.
    for mut comment in orphans {
        comment.parent_id = Some(post_fullname.clone());
        placed.insert(comment.id.clone());
        ordered.push(comment);
    }

    ordered
}

fn parent_satisfied(comment: &NewComment, post_fullname: &str, placed: &HashSet<String>) -> bool {
    match comment.parent_id.as_deref() {
        None => true,
        Some(parent) if parent == post_fullname => true,
        Some(parent) => parent
            .strip_prefix("t1_")
            .map(|id| placed.contains(id))
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, parent: Option<&str>) -> NewComment {
        NewComment {
            id: id.to_string(),
            post_id: "post1".to_string(),
            subreddit_id: 1,
            author_id: Some(1),
            body: String::new(),
            parent_id: parent.map(str::to_string),
            depth: 0,
            score: 0,
            created_at: None,
        }
    }

    fn ids(ordered: &[NewComment]) -> Vec<&str> {
        ordered.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn parents_always_precede_children() {
        // Child arrives before its parent in the input.
        let input = vec![
            comment("child", Some("t1_parent")),
            comment("parent", Some("t3_post1")),
        ];
        let ordered = plan_insertion_order("post1", input);
        assert_eq!(ids(&ordered), vec!["parent", "child"]);
    }

    #[test]
    fn irreducible_orphans_are_reparented_to_the_post() {
        let input = vec![comment("stray", Some("t1_missing"))];
        let ordered = plan_insertion_order("post1", input);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].parent_id.as_deref(), Some("t3_post1"));
    }

    #[test]
    fn every_parent_reference_resolves_after_planning() {
        let input = vec![
            comment("a", Some("t3_post1")),
            comment("d", Some("t1_c")),
            comment("b", Some("t1_a")),
            comment("c", Some("t1_b")),
            comment("x", Some("t1_gone")),
            comment("root", None),
        ];
        let ordered = plan_insertion_order("post1", input);
        assert_eq!(ordered.len(), 6);

        let mut seen: HashSet<String> = HashSet::new();
        for c in &ordered {
            match c.parent_id.as_deref() {
                None | Some("t3_post1") => {}
                Some(parent) => {
                    let pid = parent.strip_prefix("t1_").expect("comment parent");
                    assert!(seen.contains(pid), "comment {} before parent {}", c.id, pid);
                }
            }
            seen.insert(c.id.clone());
        }
    }

    #[test]
    fn chains_deeper_than_two_passes_still_resolve_via_reparenting() {
        // c3 -> c2 -> c1 all reversed: pass 1 takes c1, pass 2 takes c2,
        // c3 is left an orphan and hangs off the post.
        let input = vec![
            comment("c3", Some("t1_c2")),
            comment("c2", Some("t1_c1")),
            comment("c1", Some("t3_post1")),
        ];
        let ordered = plan_insertion_order("post1", input);
        assert_eq!(ordered.len(), 3);
        let c3 = ordered.iter().find(|c| c.id == "c3").unwrap();
        assert_eq!(c3.parent_id.as_deref(), Some("t3_post1"));
    }
}
