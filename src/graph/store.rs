//! Graph table persistence: nodes, links, communities, hierarchy rows and
//! edge bundles.
//!
//! Node and link writes are incremental upserts; the community tables are
//! derived wholesale from each detection run and therefore rebuilt every
//! tick.

use sqlx::PgPool;

use super::community::EdgeBundle;
use super::types::{GraphLink, GraphNode, NodeRow};
use crate::error::CrawlError;

#[derive(Clone)]
pub struct GraphStore {
    pool: PgPool,
}

impl GraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Full clear of every graph table (`PRECALC_CLEAR_ON_START`).
    /// Versions and diffs survive; they are the audit trail.
    pub async fn clear_all(&self) -> Result<(), CrawlError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "edge_bundles",
            "community_hierarchy",
            "communities",
            "graph_links",
            "graph_nodes",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop the derived community tables ahead of a fresh detection run.
    pub async fn clear_communities(&self) -> Result<(), CrawlError> {
        let mut tx = self.pool.begin().await?;
        for table in ["edge_bundles", "community_hierarchy", "communities"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Upsert a node. The layouter owns x/y/z; an existing position is
    /// left untouched.
    pub async fn upsert_node(&self, node: &GraphNode) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO graph_nodes (id, name, val, node_type) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 val = EXCLUDED.val, \
                 node_type = EXCLUDED.node_type",
        )
        .bind(&node.id)
        .bind(&node.name)
        .bind(node.val)
        .bind(node.node_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_link(&self, link: &GraphLink) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO graph_links (source, target) VALUES ($1, $2) \
             ON CONFLICT (source, target) DO NOTHING",
        )
        .bind(&link.source)
        .bind(&link.target)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_nodes(&self) -> Result<Vec<NodeRow>, CrawlError> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, name, val, node_type, x, y, z FROM graph_nodes",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn load_links(&self) -> Result<Vec<(String, String)>, CrawlError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT source, target FROM graph_links")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn insert_community(
        &self,
        label: &str,
        size: i32,
        modularity: f64,
    ) -> Result<i32, CrawlError> {
        let id: (i32,) = sqlx::query_as(
            "INSERT INTO communities (label, size, modularity) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(label)
        .bind(size)
        .bind(modularity)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.0)
    }

    pub async fn upsert_hierarchy_row(
        &self,
        node_id: &str,
        level: i32,
        community_id: i32,
        parent_community_id: Option<i32>,
        centroid: Option<(f64, f64, f64)>,
    ) -> Result<(), CrawlError> {
        let (cx, cy, cz) = match centroid {
            Some((x, y, z)) => (Some(x), Some(y), Some(z)),
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO community_hierarchy \
                 (node_id, level, community_id, parent_community_id, \
                  centroid_x, centroid_y, centroid_z) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (node_id, level) DO UPDATE SET \
                 community_id = EXCLUDED.community_id, \
                 parent_community_id = EXCLUDED.parent_community_id, \
                 centroid_x = EXCLUDED.centroid_x, \
                 centroid_y = EXCLUDED.centroid_y, \
                 centroid_z = EXCLUDED.centroid_z",
        )
        .bind(node_id)
        .bind(level)
        .bind(community_id)
        .bind(parent_community_id)
        .bind(cx)
        .bind(cy)
        .bind(cz)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_bundle(&self, bundle: &EdgeBundle) -> Result<(), CrawlError> {
        let (cx, cy, cz) = match bundle.control_point {
            Some((x, y, z)) => (Some(x), Some(y), Some(z)),
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO edge_bundles \
                 (source_community, target_community, weight, avg_strength, \
                  control_x, control_y, control_z) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (source_community, target_community) DO UPDATE SET \
                 weight = EXCLUDED.weight, \
                 avg_strength = EXCLUDED.avg_strength, \
                 control_x = EXCLUDED.control_x, \
                 control_y = EXCLUDED.control_y, \
                 control_z = EXCLUDED.control_z",
        )
        .bind(bundle.source_community)
        .bind(bundle.target_community)
        .bind(bundle.weight)
        .bind(bundle.avg_strength)
        .bind(cx)
        .bind(cy)
        .bind(cz)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
