//! Louvain community detection with hierarchical coarsening.
//!
//! Single level: every node starts in its own community; nodes are visited
//! in shuffled order and moved to the neighboring community with the best
//! positive modularity gain, repeating until a sweep makes no move (at
//! most 50 sweeps). Hierarchy: each detected community collapses into a
//! meta-node (intra-community weight becomes a self-loop) and Louvain runs
//! again, up to four levels or until the partition stops changing.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

/// Sweep ceiling for a single Louvain level.
const MAX_SWEEPS: usize = 50;
/// Coarsening ceiling beyond the identity level.
pub const MAX_LEVELS: usize = 4;
/// Parent sentinel for a community formed from several finer communities.
pub const PARENT_MIXED: i64 = -1;

/// Weighted undirected graph in adjacency-map form. Self-loops are stored
/// once and count twice toward the degree, as usual.
#[derive(Debug, Clone)]
pub struct UndirectedGraph {
    adj: Vec<HashMap<usize, f64>>,
}

impl UndirectedGraph {
    pub fn new(node_count: usize) -> Self {
        Self {
            adj: vec![HashMap::new(); node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.adj.len()
    }

    /// Accumulate weight on the undirected edge `{a, b}`.
    pub fn add_edge(&mut self, a: usize, b: usize, weight: f64) {
        if a == b {
            *self.adj[a].entry(a).or_insert(0.0) += weight;
        } else {
            *self.adj[a].entry(b).or_insert(0.0) += weight;
            *self.adj[b].entry(a).or_insert(0.0) += weight;
        }
    }

    pub fn neighbors(&self, v: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adj[v].iter().map(|(&u, &w)| (u, w))
    }

    fn degree(&self, v: usize) -> f64 {
        self.adj[v]
            .iter()
            .map(|(&u, &w)| if u == v { 2.0 * w } else { w })
            .sum()
    }

    /// Total edge weight `m` (each undirected edge once, self-loops once).
    fn total_weight(&self) -> f64 {
        let mut m = 0.0;
        for (v, edges) in self.adj.iter().enumerate() {
            for (&u, &w) in edges {
                if u == v {
                    m += w;
                } else if u > v {
                    m += w;
                }
            }
        }
        m
    }
}

/// One local-moving pass of Louvain. Returns a dense community assignment
/// (ids are 0..k, k = number of distinct communities).
pub fn louvain_level(graph: &UndirectedGraph, rng: &mut impl Rng) -> Vec<usize> {
    let n = graph.node_count();
    let m = graph.total_weight();
    if n == 0 || m <= 0.0 {
        return densify((0..n).collect());
    }

    let degrees: Vec<f64> = (0..n).map(|v| graph.degree(v)).collect();
    let mut community: Vec<usize> = (0..n).collect();
    // Sum of member degrees per community.
    let mut sigma_tot: Vec<f64> = degrees.clone();

    let mut order: Vec<usize> = (0..n).collect();
    for _ in 0..MAX_SWEEPS {
        order.shuffle(rng);
        let mut moved = false;

        for &v in &order {
            let current = community[v];
            let k_v = degrees[v];

            // Weight from v into each neighboring community (self-loops
            // stay with v wherever it goes and cancel out of the gain).
            let mut weight_to: HashMap<usize, f64> = HashMap::new();
            for (u, w) in graph.neighbors(v) {
                if u != v {
                    *weight_to.entry(community[u]).or_insert(0.0) += w;
                }
            }

            sigma_tot[current] -= k_v;
            let current_gain = weight_to.get(&current).copied().unwrap_or(0.0)
                - sigma_tot[current] * k_v / (2.0 * m);

            // Ties keep the current community: strict improvement only.
            let mut best = current;
            let mut best_gain = current_gain;
            for (&candidate, &k_in) in &weight_to {
                if candidate == current {
                    continue;
                }
                let gain = k_in - sigma_tot[candidate] * k_v / (2.0 * m);
                if gain > best_gain {
                    best = candidate;
                    best_gain = gain;
                }
            }

            sigma_tot[best] += k_v;
            if best != current {
                community[v] = best;
                moved = true;
            }
        }

        if !moved {
            break;
        }
    }

    densify(community)
}

/// Modularity of a partition:
/// `Q = Σ_c [Σ_in/(2m) − (Σ_tot/(2m))²]`.
pub fn modularity(graph: &UndirectedGraph, assignment: &[usize]) -> f64 {
    let m = graph.total_weight();
    if m <= 0.0 {
        return 0.0;
    }
    let communities = assignment.iter().max().map(|&c| c + 1).unwrap_or(0);
    let mut sum_in = vec![0.0; communities];
    let mut sum_tot = vec![0.0; communities];

    for v in 0..graph.node_count() {
        sum_tot[assignment[v]] += graph.degree(v);
        for (u, w) in graph.neighbors(v) {
            if assignment[u] == assignment[v] {
                // Both orientations land here for u≠v; self-loops count 2w.
                sum_in[assignment[v]] += if u == v { 2.0 * w } else { w };
            }
        }
    }

    let two_m = 2.0 * m;
    (0..communities)
        .map(|c| sum_in[c] / two_m - (sum_tot[c] / two_m).powi(2))
        .sum()
}

/// Collapse each community into a meta-node. Intra-community weight
/// becomes a self-loop on the meta-node.
pub fn collapse(graph: &UndirectedGraph, assignment: &[usize]) -> UndirectedGraph {
    let communities = assignment.iter().max().map(|&c| c + 1).unwrap_or(0);
    let mut meta = UndirectedGraph::new(communities);
    for v in 0..graph.node_count() {
        for (u, w) in graph.neighbors(v) {
            let (a, b) = (assignment[v], assignment[u]);
            if u == v {
                meta.add_edge(a, a, w);
            } else if u > v {
                meta.add_edge(a, b, w);
            }
        }
    }
    meta
}

/// Community assignments per level, composed back to the original nodes.
/// `levels[0]` is the identity partition.
#[derive(Debug, Clone)]
pub struct CommunityAssignments {
    pub levels: Vec<Vec<usize>>,
    pub modularity: Vec<f64>,
}

impl CommunityAssignments {
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn communities_at(&self, level: usize) -> usize {
        self.levels[level].iter().max().map(|&c| c + 1).unwrap_or(0)
    }

    /// Parent of each community at `level` in terms of the previous
    /// (finer) level: the unique source community, or [`PARENT_MIXED`]
    /// when the community merged several.
    pub fn parents_at(&self, level: usize) -> Vec<i64> {
        assert!(level >= 1 && level < self.levels.len());
        let coarse = &self.levels[level];
        let fine = &self.levels[level - 1];
        let mut sources: Vec<Option<i64>> = vec![None; self.communities_at(level)];
        for node in 0..coarse.len() {
            let c = coarse[node];
            let f = fine[node] as i64;
            sources[c] = match sources[c] {
                None => Some(f),
                Some(existing) if existing == f => Some(f),
                Some(_) => Some(PARENT_MIXED),
            };
        }
        sources.into_iter().map(|s| s.unwrap_or(PARENT_MIXED)).collect()
    }
}

/// Full hierarchical detection: identity level plus up to [`MAX_LEVELS`]
/// coarsening rounds. Stops early when a round no longer merges anything
/// or the meta-graph is too small to partition.
pub fn detect_hierarchy(graph: &UndirectedGraph, rng: &mut impl Rng) -> CommunityAssignments {
    let n = graph.node_count();
    let identity: Vec<usize> = (0..n).collect();
    let mut result = CommunityAssignments {
        modularity: vec![modularity(graph, &identity)],
        levels: vec![identity],
    };

    let mut current = graph.clone();
    // node → meta-node of `current`.
    let mut mapping: Vec<usize> = (0..n).collect();

    for _ in 0..MAX_LEVELS {
        if current.node_count() < 2 {
            break;
        }
        let assignment = louvain_level(&current, rng);
        let communities = assignment.iter().max().map(|&c| c + 1).unwrap_or(0);
        if communities == current.node_count() {
            // No merge: the hierarchy has converged.
            break;
        }

        let composed: Vec<usize> = mapping.iter().map(|&meta| assignment[meta]).collect();
        result.modularity.push(modularity(graph, &composed));
        result.levels.push(composed);

        current = collapse(&current, &assignment);
        mapping = mapping.iter().map(|&meta| assignment[meta]).collect();
    }

    result
}

/// Renumber arbitrary community labels to a dense 0..k range, preserving
/// first-appearance order.
fn densify(assignment: Vec<usize>) -> Vec<usize> {
    let mut remap: HashMap<usize, usize> = HashMap::new();
    assignment
        .into_iter()
        .map(|c| {
            let next = remap.len();
            *remap.entry(c).or_insert(next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Two triangles joined by a single weak edge.
    fn two_clusters() -> UndirectedGraph {
        let mut g = UndirectedGraph::new(6);
        for &(a, b) in &[(0, 1), (1, 2), (0, 2)] {
            g.add_edge(a, b, 1.0);
        }
        for &(a, b) in &[(3, 4), (4, 5), (3, 5)] {
            g.add_edge(a, b, 1.0);
        }
        g.add_edge(2, 3, 0.1);
        g
    }

    #[test]
    fn two_obvious_clusters_are_found() {
        let g = two_clusters();
        let mut rng = StdRng::seed_from_u64(7);
        let assignment = louvain_level(&g, &mut rng);

        assert_eq!(assignment[0], assignment[1]);
        assert_eq!(assignment[1], assignment[2]);
        assert_eq!(assignment[3], assignment[4]);
        assert_eq!(assignment[4], assignment[5]);
        assert_ne!(assignment[0], assignment[3]);
    }

    #[test]
    fn detection_beats_the_singleton_partition() {
        let g = two_clusters();
        let mut rng = StdRng::seed_from_u64(3);
        let assignment = louvain_level(&g, &mut rng);

        let singletons: Vec<usize> = (0..6).collect();
        assert!(modularity(&g, &assignment) >= modularity(&g, &singletons));
    }

    #[test]
    fn hierarchy_on_two_clusters_stops_after_level_one() {
        let g = two_clusters();
        let mut rng = StdRng::seed_from_u64(11);
        let hierarchy = detect_hierarchy(&g, &mut rng);

        // Level 0 is the identity partition.
        assert_eq!(hierarchy.levels[0], (0..6).collect::<Vec<_>>());
        // Level 1: exactly two communities of three members each.
        assert_eq!(hierarchy.level_count(), 2);
        assert_eq!(hierarchy.communities_at(1), 2);
        let level1 = &hierarchy.levels[1];
        let size0 = level1.iter().filter(|&&c| c == level1[0]).count();
        assert_eq!(size0, 3);
    }

    #[test]
    fn merged_communities_report_the_mixed_parent() {
        let g = two_clusters();
        let mut rng = StdRng::seed_from_u64(5);
        let hierarchy = detect_hierarchy(&g, &mut rng);

        // Both level-1 communities merged three singletons apiece.
        let parents = hierarchy.parents_at(1);
        assert_eq!(parents.len(), 2);
        assert!(parents.iter().all(|&p| p == PARENT_MIXED));
    }

    #[test]
    fn modularity_of_everything_in_one_community_is_zero() {
        let g = two_clusters();
        let all_one = vec![0usize; 6];
        assert!(modularity(&g, &all_one).abs() < 1e-9);
    }

    #[test]
    fn collapse_aggregates_intra_weight_into_self_loops() {
        let g = two_clusters();
        let assignment = vec![0, 0, 0, 1, 1, 1];
        let meta = collapse(&g, &assignment);
        assert_eq!(meta.node_count(), 2);
        // Each triangle carries weight 3.0 inside; the bridge is 0.1.
        assert!((meta.total_weight() - 6.1).abs() < 1e-9);
        let self_loop_0 = meta
            .neighbors(0)
            .find(|&(u, _)| u == 0)
            .map(|(_, w)| w)
            .unwrap();
        assert!((self_loop_0 - 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_and_single_node_graphs_are_handled() {
        let empty = UndirectedGraph::new(0);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(louvain_level(&empty, &mut rng).is_empty());
        assert_eq!(detect_hierarchy(&empty, &mut rng).level_count(), 1);

        let lonely = UndirectedGraph::new(1);
        let hierarchy = detect_hierarchy(&lonely, &mut rng);
        assert_eq!(hierarchy.levels[0], vec![0]);
        assert_eq!(hierarchy.level_count(), 1);
    }

    #[test]
    fn star_graph_converges_within_the_sweep_budget() {
        let mut g = UndirectedGraph::new(12);
        for leaf in 1..12 {
            g.add_edge(0, leaf, 1.0);
        }
        let mut rng = StdRng::seed_from_u64(9);
        // Must terminate (bounded sweeps) and produce a valid dense labeling.
        let assignment = louvain_level(&g, &mut rng);
        let k = assignment.iter().max().unwrap() + 1;
        for c in 0..k {
            assert!(assignment.contains(&c));
        }
    }
}
