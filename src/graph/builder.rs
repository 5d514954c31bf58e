//! Graph materialization tick.
//!
//! Each tick turns the relational corpus into nodes and links, runs
//! hierarchical community detection over the result, and records a
//! version with a diff against the previous tick's snapshot. Node and
//! link writes are incremental upserts unless a full clear is configured;
//! the community tables are derived and rebuilt every tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::PgPool;
use tracing::{info, warn};

use super::community::{bundle_links, centroid};
use super::louvain::{detect_hierarchy, UndirectedGraph, PARENT_MIXED};
use super::store::GraphStore;
use super::types::{GraphLink, GraphNode, NodeType};
use super::versions::{diff_snapshots, Snapshot, VersionStore, VersionSummary};
use crate::config::Config;
use crate::database::{ActivityStore, CommentStore, PostStore, SubredditStore, UserStore};
use crate::error::CrawlError;
use crate::shutdown::{self, Signal};

pub struct GraphBuilder {
    cfg: Arc<Config>,
    subreddits: SubredditStore,
    users: UserStore,
    posts: PostStore,
    comments: CommentStore,
    activity: ActivityStore,
    store: GraphStore,
    versions: VersionStore,
}

impl GraphBuilder {
    pub fn new(pool: PgPool, cfg: Arc<Config>) -> Self {
        let versions = VersionStore::new(pool.clone(), cfg.graph_version_retention);
        Self {
            subreddits: SubredditStore::new(pool.clone()),
            users: UserStore::new(pool.clone()),
            posts: PostStore::new(pool.clone()),
            comments: CommentStore::new(pool.clone()),
            activity: ActivityStore::new(pool.clone()),
            store: GraphStore::new(pool),
            versions,
            cfg,
        }
    }

    /// Periodic precompute until shutdown. The previous snapshot is kept
    /// in memory; precompute is single-writer so this is the only task
    /// that needs it.
    pub async fn run_loop(self, signal: Signal) {
        info!(
            interval_secs = self.cfg.precalc_interval.as_secs(),
            "graph precompute loop started"
        );
        let mut previous: Option<Snapshot> = None;
        loop {
            if shutdown::is_triggered(&signal) {
                break;
            }
            match self.run_once(&signal, previous.as_ref()).await {
                Ok(snapshot) => previous = Some(snapshot),
                Err(CrawlError::Cancelled) => break,
                Err(err) => warn!(error = %err, "graph precompute failed"),
            }
            if !shutdown::sleep(&signal, self.cfg.precalc_interval).await {
                break;
            }
        }
        info!("graph precompute loop stopped");
    }

    /// One full precompute tick. Returns the snapshot recorded for the
    /// version diff so the caller can carry it into the next tick.
    pub async fn run_once(
        &self,
        signal: &Signal,
        previous: Option<&Snapshot>,
    ) -> Result<Snapshot, CrawlError> {
        let started = Instant::now();

        if self.cfg.precalc_clear_on_start {
            self.store.clear_all().await?;
        } else {
            self.store.clear_communities().await?;
        }

        let users = self.users.all().await?;
        let subreddits = self.subreddits.all().await?;
        info!(
            users = users.len(),
            subreddits = subreddits.len(),
            "graph precompute tick started"
        );

        let totals = self.compute_activity(signal, &users).await?;
        if shutdown::is_triggered(signal) {
            return Err(CrawlError::Cancelled);
        }

        let activity_rows = self.activity.all_activity().await?;
        self.compute_cooccurrence(&activity_rows).await?;
        let relationships = self.activity.all_relationships().await?;

        // ── Nodes and links ─────────────────────────────────────────
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut links: HashSet<GraphLink> = HashSet::new();

        for (user_id, username) in &users {
            let val = totals.get(user_id).copied().unwrap_or(0) as f64;
            nodes.push(GraphNode::new(NodeType::User, user_id, username, val));
        }
        for sub in &subreddits {
            nodes.push(GraphNode::new(
                NodeType::Subreddit,
                sub.id,
                &sub.name,
                sub.subscribers as f64,
            ));
        }

        for (user_id, subreddit_id, _count) in &activity_rows {
            links.insert(GraphLink {
                source: NodeType::User.node_id(user_id),
                target: NodeType::Subreddit.node_id(subreddit_id),
            });
        }

        // Relationship strength feeds detection below; remember it.
        let mut strength: HashMap<(String, String), f64> = HashMap::new();
        for (source_id, target_id, overlap) in &relationships {
            let link = GraphLink {
                source: NodeType::Subreddit.node_id(source_id),
                target: NodeType::Subreddit.node_id(target_id),
            };
            strength.insert((link.source.clone(), link.target.clone()), *overlap as f64);
            links.insert(link);
        }

        if self.cfg.detailed_graph {
            self.add_detailed_content(signal, &subreddits, &mut nodes, &mut links)
                .await?;
        }

        for node in &nodes {
            self.store.upsert_node(node).await?;
        }
        for link in &links {
            self.store.upsert_link(link).await?;
        }
        if shutdown::is_triggered(signal) {
            return Err(CrawlError::Cancelled);
        }

        // Positions are owned by the layouter; read them back for
        // centroids and the snapshot.
        let node_rows = self.store.load_nodes().await?;
        let link_rows = self.store.load_links().await?;

        self.detect_and_persist_communities(&node_rows, &link_rows, &strength)
            .await?;

        let snapshot = Snapshot::from_rows(&node_rows, &link_rows);
        let empty = Snapshot::default();
        let diff = diff_snapshots(previous.unwrap_or(&empty), &snapshot);
        self.versions
            .record(
                VersionSummary {
                    node_count: snapshot.nodes.len() as i32,
                    link_count: snapshot.links.len() as i32,
                    duration_ms: started.elapsed().as_millis() as i64,
                    is_full_rebuild: self.cfg.precalc_clear_on_start,
                },
                &diff,
            )
            .await?;

        Ok(snapshot)
    }

    /// Per-user activity tallies, computed by a bounded worker pool.
    async fn compute_activity(
        &self,
        signal: &Signal,
        users: &[(i32, String)],
    ) -> Result<HashMap<i32, i64>, CrawlError> {
        if users.is_empty() {
            return Ok(HashMap::new());
        }
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = self
            .cfg
            .precalc_activity_workers
            .min(parallelism)
            .min(users.len())
            .max(1);

        let user_ids: Vec<i32> = users.iter().map(|(user_id, _)| *user_id).collect();
        let totals: Vec<Option<(i32, i64)>> = futures::stream::iter(user_ids.into_iter())
            .map(|user_id| {
            let activity = self.activity.clone();
            let users_store = self.users.clone();
            let signal = signal.clone();
            async move {
                if shutdown::is_triggered(&signal) {
                    return None;
                }
                let rows = match activity.user_activity(user_id).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(user_id, error = %err, "activity tally failed");
                        return None;
                    }
                };
                let mut total = 0i64;
                for (subreddit_id, count) in &rows {
                    total += count;
                    if let Err(err) = activity.upsert_activity(user_id, *subreddit_id, *count).await
                    {
                        warn!(user_id, subreddit_id, error = %err, "activity upsert failed");
                    }
                }
                if let Err(err) = users_store.set_total_activity(user_id, total).await {
                    warn!(user_id, error = %err, "total activity update failed");
                }
                Some((user_id, total))
            }
        })
        .buffer_unordered(workers)
        .collect()
        .await;

        Ok(totals.into_iter().flatten().collect())
    }

    /// Symmetric subreddit co-occurrence: for every user, every unordered
    /// pair of their subreddits counts once; both directions are stored.
    async fn compute_cooccurrence(&self, activity: &[(i32, i32, i64)]) -> Result<(), CrawlError> {
        let mut by_user: HashMap<i32, Vec<i32>> = HashMap::new();
        for (user_id, subreddit_id, _count) in activity {
            by_user.entry(*user_id).or_default().push(*subreddit_id);
        }

        let mut pairs: HashMap<(i32, i32), i64> = HashMap::new();
        for subs in by_user.values() {
            let mut subs = subs.clone();
            subs.sort_unstable();
            subs.dedup();
            for i in 0..subs.len() {
                for j in (i + 1)..subs.len() {
                    *pairs.entry((subs[i], subs[j])).or_insert(0) += 1;
                }
            }
        }

        for ((a, b), overlap) in &pairs {
            self.activity.upsert_relationship(*a, *b, *overlap).await?;
            self.activity.upsert_relationship(*b, *a, *overlap).await?;
        }
        Ok(())
    }

    /// Detailed mode: post and comment nodes with their containment,
    /// reply, and authorship edges.
    async fn add_detailed_content(
        &self,
        signal: &Signal,
        subreddits: &[crate::database::SubredditRow],
        nodes: &mut Vec<GraphNode>,
        links: &mut HashSet<GraphLink>,
    ) -> Result<(), CrawlError> {
        let mut author_links: HashMap<i32, usize> = HashMap::new();
        let max_author_links = self.cfg.max_author_content_links;

        for sub in subreddits {
            if shutdown::is_triggered(signal) {
                return Err(CrawlError::Cancelled);
            }
            let sub_node = NodeType::Subreddit.node_id(sub.id);
            let posts = self
                .posts
                .top_for_subreddit(sub.id, self.cfg.posts_per_sub_in_graph as i64)
                .await?;

            for (post_id, title, author_id, score) in &posts {
                let post_node = NodeType::Post.node_id(post_id);
                nodes.push(GraphNode::new(
                    NodeType::Post,
                    post_id,
                    title,
                    *score as f64,
                ));
                links.insert(GraphLink {
                    source: sub_node.clone(),
                    target: post_node.clone(),
                });
                if let Some(author_id) = author_id {
                    let spent = author_links.entry(*author_id).or_insert(0);
                    if *spent < max_author_links {
                        *spent += 1;
                        links.insert(GraphLink {
                            source: NodeType::User.node_id(author_id),
                            target: post_node.clone(),
                        });
                    }
                }

                let comments = self
                    .comments
                    .first_for_post(post_id, self.cfg.comments_per_post_in_graph as i64)
                    .await?;
                let comment_ids: HashSet<&String> =
                    comments.iter().map(|(id, _, _, _, _)| id).collect();

                for (comment_id, parent_id, author_id, body, score) in &comments {
                    let comment_node = NodeType::Comment.node_id(comment_id);
                    nodes.push(GraphNode::new(
                        NodeType::Comment,
                        comment_id,
                        body,
                        *score as f64,
                    ));

                    // Reply edge to the parent comment when it made the
                    // cut, otherwise containment from the post.
                    let parent_node = parent_id
                        .as_deref()
                        .and_then(|p| p.strip_prefix("t1_"))
                        .filter(|p| comment_ids.contains(&p.to_string()))
                        .map(|p| NodeType::Comment.node_id(p))
                        .unwrap_or_else(|| post_node.clone());
                    links.insert(GraphLink {
                        source: parent_node,
                        target: comment_node.clone(),
                    });

                    if let Some(author_id) = author_id {
                        let spent = author_links.entry(*author_id).or_insert(0);
                        if *spent < max_author_links {
                            *spent += 1;
                            links.insert(GraphLink {
                                source: NodeType::User.node_id(author_id),
                                target: comment_node.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Louvain over the materialized graph; persists communities,
    /// per-node hierarchy rows with centroids, and level-1 edge bundles.
    async fn detect_and_persist_communities(
        &self,
        node_rows: &[super::types::NodeRow],
        link_rows: &[(String, String)],
        strength: &HashMap<(String, String), f64>,
    ) -> Result<(), CrawlError> {
        if node_rows.is_empty() {
            return Ok(());
        }

        let index: HashMap<&str, usize> = node_rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.id.as_str(), i))
            .collect();

        let mut graph = UndirectedGraph::new(node_rows.len());
        for (source, target) in link_rows {
            let (Some(&a), Some(&b)) = (index.get(source.as_str()), index.get(target.as_str()))
            else {
                continue;
            };
            let weight = strength
                .get(&(source.clone(), target.clone()))
                .copied()
                .unwrap_or(1.0);
            graph.add_edge(a, b, weight);
        }

        let mut rng = StdRng::from_entropy();
        let hierarchy = detect_hierarchy(&graph, &mut rng);
        if hierarchy.level_count() < 2 {
            info!("graph too small for community detection; skipping");
            return Ok(());
        }

        // level → ordinal → communities.id
        let mut db_ids: Vec<Vec<i32>> = Vec::new();
        let positions: Vec<Option<(f64, f64, f64)>> =
            node_rows.iter().map(|row| row.position()).collect();

        for level in 1..hierarchy.level_count() {
            let assignment = &hierarchy.levels[level];
            let count = hierarchy.communities_at(level);
            let level_modularity = hierarchy.modularity[level];
            let parents = hierarchy.parents_at(level);

            let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
            for (node, &community) in assignment.iter().enumerate() {
                members[community].push(node);
            }

            let mut level_ids = Vec::with_capacity(count);
            let mut centroids: Vec<Option<(f64, f64, f64)>> = Vec::with_capacity(count);
            for (ordinal, member_nodes) in members.iter().enumerate() {
                let label = community_label(node_rows, member_nodes, level, ordinal);
                let id = self
                    .store
                    .insert_community(&label, member_nodes.len() as i32, level_modularity)
                    .await?;
                level_ids.push(id);

                let positioned: Vec<(f64, f64, f64)> = member_nodes
                    .iter()
                    .filter_map(|&n| positions[n])
                    .collect();
                centroids.push(centroid(&positioned));
            }

            for (node, &community) in assignment.iter().enumerate() {
                let parent = match parents[community] {
                    PARENT_MIXED => Some(-1),
                    source if level >= 2 => Some(db_ids[level - 2][source as usize]),
                    // Level 1 descends from implicit singletons.
                    _ => None,
                };
                self.store
                    .upsert_hierarchy_row(
                        &node_rows[node].id,
                        level as i32,
                        level_ids[community],
                        parent,
                        centroids[community],
                    )
                    .await?;
            }

            db_ids.push(level_ids);
        }

        // Bundles aggregate level-1 crossings.
        let level1 = &hierarchy.levels[1];
        let level1_ids = &db_ids[0];
        let centroid_map: HashMap<i64, (f64, f64, f64)> = {
            let mut members: HashMap<usize, Vec<(f64, f64, f64)>> = HashMap::new();
            for (node, &community) in level1.iter().enumerate() {
                if let Some(position) = positions[node] {
                    members.entry(community).or_default().push(position);
                }
            }
            members
                .into_iter()
                .filter_map(|(community, positioned)| {
                    centroid(&positioned).map(|c| (level1_ids[community] as i64, c))
                })
                .collect()
        };

        let crossings = link_rows.iter().filter_map(|(source, target)| {
            let (&a, &b) = (index.get(source.as_str())?, index.get(target.as_str())?);
            let (ca, cb) = (level1[a], level1[b]);
            (ca != cb).then(|| {
                let weight = strength
                    .get(&(source.clone(), target.clone()))
                    .copied()
                    .unwrap_or(1.0);
                (level1_ids[ca] as i64, level1_ids[cb] as i64, weight)
            })
        });
        for bundle in bundle_links(crossings, &centroid_map) {
            self.store.upsert_bundle(&bundle).await?;
        }

        info!(
            levels = hierarchy.level_count() - 1,
            level1_communities = hierarchy.communities_at(1),
            modularity = hierarchy.modularity.last().copied().unwrap_or(0.0),
            "community detection persisted"
        );
        Ok(())
    }
}

/// Label a community after its highest-valued member.
fn community_label(
    node_rows: &[super::types::NodeRow],
    members: &[usize],
    level: usize,
    ordinal: usize,
) -> String {
    members
        .iter()
        .max_by(|&&a, &&b| {
            node_rows[a]
                .val
                .partial_cmp(&node_rows[b].val)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|&n| node_rows[n].name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("community-{level}-{ordinal}"))
}
