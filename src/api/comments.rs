//! Comment-tree flattening.
//!
//! The comments endpoint returns a nested reply tree; persistence wants a
//! flat list with parent fullnames and depths. Traversal is depth-first,
//! halts at the configured depth, stops once enough comments were
//! collected, and drops deleted/anonymous authors and `more` stubs.

use serde_json::Value;

use super::models::RawComment;

/// Flatten the comment listing (the second element of the upstream
/// response array) into at most `max_comments` comments of depth
/// ≤ `max_depth`.
pub fn flatten_comment_tree(listing: &Value, max_depth: i32, max_comments: usize) -> Vec<RawComment> {
    let mut out = Vec::new();
    if let Some(children) = children_of(listing) {
        for child in children {
            walk(child, 0, max_depth, max_comments, &mut out);
        }
    }
    out
}

fn walk(node: &Value, depth: i32, max_depth: i32, max_comments: usize, out: &mut Vec<RawComment>) {
    if depth > max_depth || out.len() >= max_comments {
        return;
    }
    // `more` stubs and anything that is not a comment are skipped outright.
    if node.get("kind").and_then(Value::as_str) != Some("t1") {
        return;
    }
    let Some(data) = node.get("data") else {
        return;
    };

    let author = str_field(data, "author");
    if keep_author(&author) {
        out.push(RawComment {
            id: str_field(data, "id"),
            author,
            body: str_field(data, "body"),
            parent_id: data
                .get("parent_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            depth,
            score: data.get("score").and_then(Value::as_i64).unwrap_or(0),
            created_utc: data.get("created_utc").and_then(Value::as_f64).unwrap_or(0.0),
        });
    }

    // Replies still get visited when the author was filtered; their rows
    // become orphans and are reparented to the post at insert time.
    if let Some(replies) = data.get("replies") {
        if let Some(children) = children_of(replies) {
            for child in children {
                walk(child, depth + 1, max_depth, max_comments, out);
            }
        }
    }
}

fn children_of(value: &Value) -> Option<&Vec<Value>> {
    value.get("data")?.get("children")?.as_array()
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn keep_author(author: &str) -> bool {
    !author.is_empty() && author != "[deleted]"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment(id: &str, author: &str, parent: &str, replies: Value) -> Value {
        json!({
            "kind": "t1",
            "data": {
                "id": id,
                "author": author,
                "body": format!("body of {id}"),
                "parent_id": parent,
                "score": 1,
                "created_utc": 1700000000.0,
                "replies": replies
            }
        })
    }

    fn listing(children: Vec<Value>) -> Value {
        json!({"kind": "Listing", "data": {"children": children}})
    }

    #[test]
    fn flattens_nested_replies_with_depths() {
        let tree = listing(vec![comment(
            "c1",
            "alice",
            "t3_post",
            listing(vec![comment("c2", "bob", "t1_c1", json!(""))]),
        )]);
        let flat = flatten_comment_tree(&tree, 10, 100);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].id, "c1");
        assert_eq!(flat[0].depth, 0);
        assert_eq!(flat[1].id, "c2");
        assert_eq!(flat[1].depth, 1);
        assert_eq!(flat[1].parent_id.as_deref(), Some("t1_c1"));
    }

    #[test]
    fn depth_limit_halts_traversal() {
        let tree = listing(vec![comment(
            "c1",
            "alice",
            "t3_post",
            listing(vec![comment(
                "c2",
                "bob",
                "t1_c1",
                listing(vec![comment("c3", "carol", "t1_c2", json!(""))]),
            )]),
        )]);
        let flat = flatten_comment_tree(&tree, 1, 100);
        let ids: Vec<&str> = flat.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(flat.iter().all(|c| c.depth <= 1));
    }

    #[test]
    fn deleted_authors_are_filtered_but_descendants_survive() {
        let tree = listing(vec![comment(
            "c1",
            "[deleted]",
            "t3_post",
            listing(vec![comment("c2", "bob", "t1_c1", json!(""))]),
        )]);
        let flat = flatten_comment_tree(&tree, 10, 100);
        let ids: Vec<&str> = flat.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2"]);
    }

    #[test]
    fn more_stubs_are_skipped() {
        let tree = listing(vec![
            json!({"kind": "more", "data": {"children": ["x", "y"]}}),
            comment("c1", "alice", "t3_post", json!("")),
        ]);
        let flat = flatten_comment_tree(&tree, 10, 100);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].id, "c1");
    }

    #[test]
    fn comment_cap_is_respected() {
        let children: Vec<Value> = (0..20)
            .map(|i| comment(&format!("c{i}"), "alice", "t3_post", json!("")))
            .collect();
        let flat = flatten_comment_tree(&listing(children), 10, 5);
        assert_eq!(flat.len(), 5);
    }

    #[test]
    fn empty_replies_string_is_tolerated() {
        let tree = listing(vec![comment("c1", "alice", "t3_post", json!(""))]);
        assert_eq!(flatten_comment_tree(&tree, 10, 100).len(), 1);
    }
}
