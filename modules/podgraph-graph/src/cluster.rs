use tracing::{debug, info};

use podgraph_common::error::PodGraphError;
use podgraph_common::types::Cluster;

use crate::reader::GraphReader;
use crate::store::GraphStore;

/// Default similarity threshold below which a unit stays unassigned.
pub const DEFAULT_ASSIGN_THRESHOLD: f64 = 0.6;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AssignStats {
    pub assigned: u32,
    pub left_unassigned: u32,
}

/// Nearest-centroid cluster assignment for an episode's units. Centroids
/// come from whatever clustering job populated the `Cluster` nodes; when
/// none exist the stage is a no-op and every unit stays unassigned.
pub struct ClusterAssigner {
    threshold: f64,
}

impl ClusterAssigner {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub async fn assign_episode(
        &self,
        reader: &GraphReader,
        store: &GraphStore,
        episode_id: &str,
    ) -> Result<AssignStats, PodGraphError> {
        let clusters = reader.clusters().await?;
        let mut stats = AssignStats::default();
        if clusters.is_empty() {
            debug!(episode_id, "no cluster centroids, skipping assignment");
            return Ok(stats);
        }

        let units = reader.unclustered_units(episode_id).await?;
        for (unit_id, embedding) in &units {
            match nearest_centroid(embedding, &clusters, self.threshold) {
                Some((cluster_id, similarity)) => {
                    store.assign_cluster(unit_id, cluster_id).await?;
                    debug!(unit_id, cluster_id, similarity, "unit assigned to cluster");
                    stats.assigned += 1;
                }
                None => stats.left_unassigned += 1,
            }
        }
        info!(
            episode_id,
            assigned = stats.assigned,
            unassigned = stats.left_unassigned,
            "cluster assignment complete"
        );
        Ok(stats)
    }
}

/// Best cluster at or above the threshold, or None.
pub fn nearest_centroid<'a>(
    embedding: &[f32],
    clusters: &'a [Cluster],
    threshold: f64,
) -> Option<(&'a str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for cluster in clusters {
        let sim = cosine_similarity(embedding, &cluster.centroid);
        if sim >= threshold && best.map_or(true, |(_, b)| sim > b) {
            best = Some((cluster.id.as_str(), sim));
        }
    }
    best
}
