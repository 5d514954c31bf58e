//! Graph snapshot versioning: one version row per successful precompute,
//! a diff against the previous snapshot, and retention pruning.

use std::collections::{HashMap, HashSet};

use sqlx::PgPool;
use tracing::info;

use super::types::NodeRow;
use crate::error::CrawlError;

/// Positions closer than this are considered unchanged.
const POSITION_EPSILON: f64 = 1e-4;

/// In-memory image of the graph tables at the end of a precompute.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: HashMap<String, NodeState>,
    pub links: HashSet<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub val: f64,
    pub position: Option<(f64, f64, f64)>,
}

impl Snapshot {
    pub fn from_rows(nodes: &[NodeRow], links: &[(String, String)]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|row| {
                    (
                        row.id.clone(),
                        NodeState {
                            val: row.val,
                            position: row.position(),
                        },
                    )
                })
                .collect(),
            links: links.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    Add,
    Update,
    Remove,
}

impl DiffAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffAction::Add => "add",
            DiffAction::Update => "update",
            DiffAction::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub action: DiffAction,
    /// `node` or `link`.
    pub entity_type: &'static str,
    pub entity_id: String,
    pub old_val: Option<f64>,
    pub new_val: Option<f64>,
    pub old_position: Option<(f64, f64, f64)>,
    pub new_position: Option<(f64, f64, f64)>,
}

/// Compare two snapshots. Diffing a snapshot against itself is empty;
/// diffing against the default (empty) snapshot yields all adds.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<DiffEntry> {
    let mut entries = Vec::new();

    for (id, state) in &new.nodes {
        match old.nodes.get(id) {
            None => entries.push(node_entry(DiffAction::Add, id, None, Some(state))),
            Some(previous) if node_changed(previous, state) => {
                entries.push(node_entry(DiffAction::Update, id, Some(previous), Some(state)));
            }
            Some(_) => {}
        }
    }
    for (id, state) in &old.nodes {
        if !new.nodes.contains_key(id) {
            entries.push(node_entry(DiffAction::Remove, id, Some(state), None));
        }
    }

    for link in &new.links {
        if !old.links.contains(link) {
            entries.push(link_entry(DiffAction::Add, link));
        }
    }
    for link in &old.links {
        if !new.links.contains(link) {
            entries.push(link_entry(DiffAction::Remove, link));
        }
    }

    entries
}

fn node_changed(old: &NodeState, new: &NodeState) -> bool {
    if old.val != new.val {
        return true;
    }
    match (old.position, new.position) {
        (None, None) => false,
        (Some(a), Some(b)) => {
            (a.0 - b.0).abs() > POSITION_EPSILON
                || (a.1 - b.1).abs() > POSITION_EPSILON
                || (a.2 - b.2).abs() > POSITION_EPSILON
        }
        _ => true,
    }
}

fn node_entry(
    action: DiffAction,
    id: &str,
    old: Option<&NodeState>,
    new: Option<&NodeState>,
) -> DiffEntry {
    DiffEntry {
        action,
        entity_type: "node",
        entity_id: id.to_string(),
        old_val: old.map(|s| s.val),
        new_val: new.map(|s| s.val),
        old_position: old.and_then(|s| s.position),
        new_position: new.and_then(|s| s.position),
    }
}

fn link_entry(action: DiffAction, link: &(String, String)) -> DiffEntry {
    DiffEntry {
        action,
        entity_type: "link",
        entity_id: format!("{}->{}", link.0, link.1),
        old_val: None,
        new_val: None,
        old_position: None,
        new_position: None,
    }
}

/// Counters recorded with each version row.
#[derive(Debug, Clone, Copy)]
pub struct VersionSummary {
    pub node_count: i32,
    pub link_count: i32,
    pub duration_ms: i64,
    pub is_full_rebuild: bool,
}

pub struct VersionStore {
    pool: PgPool,
    retention: usize,
}

impl VersionStore {
    pub fn new(pool: PgPool, retention: usize) -> Self {
        Self {
            pool,
            retention: retention.max(1),
        }
    }

    /// Record a completed precompute: the version row, its diff entries,
    /// and a retention prune. Returns the version id.
    pub async fn record(
        &self,
        summary: VersionSummary,
        diff: &[DiffEntry],
    ) -> Result<i32, CrawlError> {
        let mut tx = self.pool.begin().await?;

        let version_id: (i32,) = sqlx::query_as(
            "INSERT INTO graph_versions \
                 (node_count, link_count, status, duration_ms, is_full_rebuild) \
             VALUES ($1, $2, 'complete', $3, $4) RETURNING id",
        )
        .bind(summary.node_count)
        .bind(summary.link_count)
        .bind(summary.duration_ms)
        .bind(summary.is_full_rebuild)
        .fetch_one(&mut *tx)
        .await?;

        for entry in diff {
            let (old_x, old_y, old_z) = split(entry.old_position);
            let (new_x, new_y, new_z) = split(entry.new_position);
            sqlx::query(
                "INSERT INTO graph_diffs \
                     (version_id, action, entity_type, entity_id, old_val, new_val, \
                      old_x, old_y, old_z, new_x, new_y, new_z) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(version_id.0)
            .bind(entry.action.as_str())
            .bind(entry.entity_type)
            .bind(&entry.entity_id)
            .bind(entry.old_val)
            .bind(entry.new_val)
            .bind(old_x)
            .bind(old_y)
            .bind(old_z)
            .bind(new_x)
            .bind(new_y)
            .bind(new_z)
            .execute(&mut *tx)
            .await?;
        }

        // Prune oldest versions beyond retention, diffs first.
        sqlx::query(
            "DELETE FROM graph_diffs WHERE version_id IN ( \
                 SELECT id FROM graph_versions ORDER BY id DESC OFFSET $1)",
        )
        .bind(self.retention as i64)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM graph_versions WHERE id IN ( \
                 SELECT id FROM graph_versions ORDER BY id DESC OFFSET $1)",
        )
        .bind(self.retention as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            version_id = version_id.0,
            nodes = summary.node_count,
            links = summary.link_count,
            diff_entries = diff.len(),
            "graph version recorded"
        );
        Ok(version_id.0)
    }
}

fn split(position: Option<(f64, f64, f64)>) -> (Option<f64>, Option<f64>, Option<f64>) {
    match position {
        Some((x, y, z)) => (Some(x), Some(y), Some(z)),
        None => (None, None, None),
    }
}
