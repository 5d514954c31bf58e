//! Graph derivation: materialization, community detection, versioning.
//!
//! The builder turns the relational corpus into a typed property graph
//! (users, subreddits, optionally posts and comments), Louvain labels its
//! community structure hierarchically, and every tick is recorded as a
//! version with a diff against the previous one.

pub mod builder;
pub mod community;
pub mod louvain;
pub mod store;
pub mod types;
pub mod versions;

pub use builder::GraphBuilder;
pub use community::{bundle_links, centroid, control_point, EdgeBundle};
pub use louvain::{
    collapse, detect_hierarchy, louvain_level, modularity, CommunityAssignments, UndirectedGraph,
    MAX_LEVELS, PARENT_MIXED,
};
pub use store::GraphStore;
pub use types::{truncate_runes, GraphLink, GraphNode, NodeRow, NodeType, MAX_NAME_RUNES};
pub use versions::{diff_snapshots, DiffAction, DiffEntry, Snapshot, VersionStore, VersionSummary};
