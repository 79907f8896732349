use neo4rs::query;
use serde::Serialize;

use podgraph_common::error::PodGraphError;

use crate::GraphClient;

/// Read-side queries: database stats and the post-ingest analyses.
pub struct GraphReader {
    client: GraphClient,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub episodes: i64,
    pub units: i64,
    pub entities: i64,
    pub quotes: i64,
    pub insights: i64,
    pub clusters: i64,
}

/// A high-importance entity with few relationships: a likely gap in the
/// extracted knowledge.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeGap {
    pub entity_id: String,
    pub name: String,
    pub importance: i64,
    pub relationship_count: i64,
}

/// Pair of entities repeatedly co-mentioned without any `RELATES_TO` edge.
#[derive(Debug, Clone, Serialize)]
pub struct MissingLink {
    pub source_id: String,
    pub source_name: String,
    pub target_id: String,
    pub target_name: String,
    pub shared_units: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiversityReport {
    pub by_type: Vec<(String, i64)>,
    /// Shannon entropy of the type distribution, in bits.
    pub entropy_bits: f64,
}

impl GraphReader {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub async fn stats(&self) -> Result<GraphStats, PodGraphError> {
        let mut stats = GraphStats::default();
        for (label, slot) in [
            ("Episode", 0),
            ("MeaningfulUnit", 1),
            ("Entity", 2),
            ("Quote", 3),
            ("Insight", 4),
            ("Cluster", 5),
        ] {
            let q = query(&format!("MATCH (n:{label}) RETURN count(n) AS cnt"));
            let count = self.single_i64(q, "cnt").await?;
            match slot {
                0 => stats.episodes = count,
                1 => stats.units = count,
                2 => stats.entities = count,
                3 => stats.quotes = count,
                4 => stats.insights = count,
                _ => stats.clusters = count,
            }
        }
        Ok(stats)
    }

    /// Entities of importance >= `min_importance` with fewer than
    /// `max_links` relationships.
    pub async fn knowledge_gaps(
        &self,
        min_importance: i64,
        max_links: i64,
        limit: i64,
    ) -> Result<Vec<KnowledgeGap>, PodGraphError> {
        let q = query(
            "MATCH (n:Entity)
             WHERE n.importance >= $min_importance
             OPTIONAL MATCH (n)-[r:RELATES_TO]-(:Entity)
             WITH n, count(r) AS rel_count
             WHERE rel_count < $max_links
             RETURN n.id AS id, n.name AS name, n.importance AS importance, rel_count
             ORDER BY n.importance DESC, rel_count ASC
             LIMIT $limit",
        )
        .param("min_importance", min_importance)
        .param("max_links", max_links)
        .param("limit", limit);

        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut gaps = Vec::new();
        while let Some(row) = stream.next().await.map_err(read_err)? {
            gaps.push(KnowledgeGap {
                entity_id: row.get("id").unwrap_or_default(),
                name: row.get("name").unwrap_or_default(),
                importance: row.get("importance").unwrap_or(0),
                relationship_count: row.get("rel_count").unwrap_or(0),
            });
        }
        Ok(gaps)
    }

    /// Entity-type distribution plus its Shannon entropy.
    pub async fn diversity(&self) -> Result<DiversityReport, PodGraphError> {
        let q = query(
            "MATCH (n:Entity)
             RETURN n.type AS type, count(n) AS cnt
             ORDER BY cnt DESC",
        );
        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut by_type = Vec::new();
        while let Some(row) = stream.next().await.map_err(read_err)? {
            let label: String = row.get("type").unwrap_or_default();
            let cnt: i64 = row.get("cnt").unwrap_or(0);
            by_type.push((label, cnt));
        }

        let total: i64 = by_type.iter().map(|(_, c)| c).sum();
        let entropy_bits = if total == 0 {
            0.0
        } else {
            by_type
                .iter()
                .filter(|(_, c)| *c > 0)
                .map(|(_, c)| {
                    let p = *c as f64 / total as f64;
                    -p * p.log2()
                })
                .sum()
        };
        Ok(DiversityReport {
            by_type,
            entropy_bits,
        })
    }

    /// Entity pairs co-mentioned in at least `min_shared_units` units with
    /// no direct relationship edge in either direction.
    pub async fn missing_links(
        &self,
        min_shared_units: i64,
        limit: i64,
    ) -> Result<Vec<MissingLink>, PodGraphError> {
        let q = query(
            "MATCH (a:Entity)-[:MENTIONED_IN]->(u:MeaningfulUnit)<-[:MENTIONED_IN]-(b:Entity)
             WHERE a.id < b.id AND NOT (a)-[:RELATES_TO]-(b)
             WITH a, b, count(DISTINCT u) AS shared
             WHERE shared >= $min_shared
             RETURN a.id AS source_id, a.name AS source_name,
                    b.id AS target_id, b.name AS target_name, shared
             ORDER BY shared DESC
             LIMIT $limit",
        )
        .param("min_shared", min_shared_units)
        .param("limit", limit);

        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut links = Vec::new();
        while let Some(row) = stream.next().await.map_err(read_err)? {
            links.push(MissingLink {
                source_id: row.get("source_id").unwrap_or_default(),
                source_name: row.get("source_name").unwrap_or_default(),
                target_id: row.get("target_id").unwrap_or_default(),
                target_name: row.get("target_name").unwrap_or_default(),
                shared_units: row.get("shared").unwrap_or(0),
            });
        }
        Ok(links)
    }

    /// Upsert an analysis node carrying one analysis output as JSON.
    pub async fn write_analysis(
        &self,
        kind: &str,
        scope: &str,
        payload: &impl Serialize,
    ) -> Result<(), PodGraphError> {
        let q = query(
            "MERGE (a:Analysis {kind: $kind, scope: $scope})
             SET a.payload = $payload, a.updated_at = datetime($now)",
        )
        .param("kind", kind)
        .param("scope", scope)
        .param(
            "payload",
            serde_json::to_string(payload)
                .map_err(|e| PodGraphError::Validation(format!("analysis payload: {e}")))?,
        )
        .param("now", crate::store::format_datetime(&chrono::Utc::now()));
        self.client.graph.run(q).await.map_err(read_err)
    }

    /// All unit ids for an episode that carry an embedding but no cluster.
    pub async fn unclustered_units(
        &self,
        episode_id: &str,
    ) -> Result<Vec<(String, Vec<f32>)>, PodGraphError> {
        let q = query(
            "MATCH (u:MeaningfulUnit {episode_id: $episode_id})
             WHERE u.embedding IS NOT NULL AND size(u.embedding) > 0
               AND NOT (u)-[:IN_CLUSTER]->(:Cluster)
             RETURN u.id AS id, u.embedding AS embedding",
        )
        .param("episode_id", episode_id);

        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut units = Vec::new();
        while let Some(row) = stream.next().await.map_err(read_err)? {
            let id: String = row.get("id").unwrap_or_default();
            let embedding: Vec<f64> = row.get("embedding").unwrap_or_default();
            units.push((id, embedding.iter().map(|v| *v as f32).collect()));
        }
        Ok(units)
    }

    /// All clusters with centroids.
    pub async fn clusters(&self) -> Result<Vec<podgraph_common::types::Cluster>, PodGraphError> {
        let q = query(
            "MATCH (c:Cluster)
             RETURN c.id AS id, c.label AS label, c.member_count AS member_count,
                    c.centroid AS centroid",
        );
        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut clusters = Vec::new();
        while let Some(row) = stream.next().await.map_err(read_err)? {
            let centroid: Vec<f64> = row.get("centroid").unwrap_or_default();
            clusters.push(podgraph_common::types::Cluster {
                id: row.get("id").unwrap_or_default(),
                label: row.get("label").unwrap_or_default(),
                member_count: row.get::<i64>("member_count").unwrap_or(0).max(0) as u64,
                centroid: centroid.iter().map(|v| *v as f32).collect(),
            });
        }
        Ok(clusters)
    }

    /// Speaker fields for all of an episode's units, for post-processing.
    pub async fn episode_unit_speakers(
        &self,
        episode_id: &str,
    ) -> Result<Vec<UnitSpeakers>, PodGraphError> {
        let q = query(
            "MATCH (u:MeaningfulUnit {episode_id: $episode_id})
             RETURN u.id AS id, u.primary_speaker AS primary_speaker,
                    u.speaker_distribution AS speaker_distribution
             ORDER BY u.start_sec",
        )
        .param("episode_id", episode_id);

        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(read_err)? {
            let raw: String = row.get("speaker_distribution").unwrap_or_default();
            let distribution =
                serde_json::from_str::<std::collections::HashMap<String, f64>>(&raw)
                    .unwrap_or_default();
            out.push(UnitSpeakers {
                unit_id: row.get("id").unwrap_or_default(),
                primary_speaker: row.get("primary_speaker").unwrap_or_default(),
                distribution,
            });
        }
        Ok(out)
    }

    async fn single_i64(&self, q: neo4rs::Query, col: &str) -> Result<i64, PodGraphError> {
        let mut stream = self.client.graph.execute(q).await.map_err(read_err)?;
        let mut value = 0;
        while let Some(row) = stream.next().await.map_err(read_err)? {
            value = row.get(col).unwrap_or(0);
        }
        Ok(value)
    }
}

#[derive(Debug, Clone)]
pub struct UnitSpeakers {
    pub unit_id: String,
    pub primary_speaker: String,
    pub distribution: std::collections::HashMap<String, f64>,
}

fn read_err(e: neo4rs::Error) -> PodGraphError {
    PodGraphError::StorageUnavailable(e.to_string())
}
