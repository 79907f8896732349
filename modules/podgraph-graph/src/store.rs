use std::time::Duration;

use chrono::{DateTime, Utc};
use neo4rs::{query, Query};
use rand::Rng;
use tracing::{debug, warn};

use podgraph_common::error::PodGraphError;
use podgraph_common::types::{
    Cluster, Entity, EntityRelationship, Episode, Insight, MeaningfulUnit, Mention,
    ProcessingStatus, Quote,
};

use crate::GraphClient;

/// Everything extracted from one MeaningfulUnit, ready to persist. Entities
/// arrive paired with their per-unit mention context; relationships are
/// still name tuples and are resolved to entity ids here.
#[derive(Debug, Clone, Default)]
pub struct UnitKnowledge {
    pub entities: Vec<(Entity, Mention)>,
    pub quotes: Vec<Quote>,
    pub insights: Vec<Insight>,
    pub relationships: Vec<EntityRelationship>,
}

impl UnitKnowledge {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.quotes.is_empty()
            && self.insights.is_empty()
            && self.relationships.is_empty()
    }

    /// Approximate number of node/edge writes this knowledge produces,
    /// used to pack units into bounded transactions.
    pub fn write_count(&self) -> usize {
        // Unit + PART_OF, entity + mention each, quote/insight + edge each,
        // one edge per relationship and supporting entity.
        2 + self.entities.len() * 2
            + self.quotes.len() * 2
            + self.insights.len() * 2
            + self.relationships.len()
            + self
                .insights
                .iter()
                .map(|i| i.supporting_entities.len())
                .sum::<usize>()
    }
}

const MAX_TX_RETRIES: u32 = 3;

/// Write-side store for one podcast's database. Bound to a single podcast
/// so cross-podcast writes are structurally impossible; the id is still
/// checked on episode writes as a belt against mixed-up inputs.
pub struct GraphStore {
    client: GraphClient,
    podcast_id: String,
    db_batch: usize,
}

impl GraphStore {
    pub fn new(client: GraphClient, podcast_id: impl Into<String>, db_batch: usize) -> Self {
        Self {
            client,
            podcast_id: podcast_id.into(),
            db_batch: db_batch.max(1),
        }
    }

    pub fn podcast_id(&self) -> &str {
        &self.podcast_id
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    // -----------------------------------------------------------------------
    // Upserts
    // -----------------------------------------------------------------------

    pub async fn upsert_episode(&self, episode: &Episode) -> Result<(), PodGraphError> {
        if episode.podcast_id != self.podcast_id {
            return Err(PodGraphError::Validation(format!(
                "episode belongs to podcast '{}', store is bound to '{}'",
                episode.podcast_id, self.podcast_id
            )));
        }
        self.run_write_txn(|| vec![episode_query(episode)]).await
    }

    pub async fn set_episode_status(
        &self,
        episode_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), PodGraphError> {
        self.run_write_txn(|| {
            vec![query(
                "MATCH (e:Episode {id: $id})
                 SET e.processing_status = $status, e.updated_at = datetime($now)",
            )
            .param("id", episode_id)
            .param("status", status.to_string())
            .param("now", format_datetime(&Utc::now()))]
        })
        .await
    }

    pub async fn upsert_unit(
        &self,
        unit: &MeaningfulUnit,
        episode_id: &str,
    ) -> Result<(), PodGraphError> {
        self.run_write_txn(|| vec![unit_query(unit, episode_id)])
            .await
    }

    /// Persist one unit and all its knowledge in a single transaction, so a
    /// failed episode leaves units either complete or absent.
    pub async fn persist_unit(
        &self,
        unit: &MeaningfulUnit,
        knowledge: &UnitKnowledge,
    ) -> Result<(), PodGraphError> {
        self.run_write_txn(|| unit_knowledge_queries(unit, knowledge))
            .await
    }

    /// Persist many units, packing successive units into transactions of at
    /// most `db_batch` writes. Units never straddle a transaction boundary.
    pub async fn persist_units(
        &self,
        units: &[(MeaningfulUnit, UnitKnowledge)],
    ) -> Result<(), PodGraphError> {
        let mut chunk_start = 0usize;
        let mut writes = 0usize;
        for (i, (_, knowledge)) in units.iter().enumerate() {
            let unit_writes = knowledge.write_count();
            if writes > 0 && writes + unit_writes > self.db_batch {
                self.persist_chunk(&units[chunk_start..i]).await?;
                chunk_start = i;
                writes = 0;
            }
            writes += unit_writes;
        }
        if chunk_start < units.len() {
            self.persist_chunk(&units[chunk_start..]).await?;
        }
        Ok(())
    }

    async fn persist_chunk(
        &self,
        chunk: &[(MeaningfulUnit, UnitKnowledge)],
    ) -> Result<(), PodGraphError> {
        self.run_write_txn(|| {
            chunk
                .iter()
                .flat_map(|(unit, knowledge)| unit_knowledge_queries(unit, knowledge))
                .collect()
        })
        .await
    }

    pub async fn upsert_cluster(&self, cluster: &Cluster) -> Result<(), PodGraphError> {
        self.run_write_txn(|| {
            vec![query(
                "MERGE (c:Cluster {id: $id})
                 SET c.label = $label, c.member_count = $member_count, c.centroid = $centroid",
            )
            .param("id", cluster.id.as_str())
            .param("label", cluster.label.as_str())
            .param("member_count", cluster.member_count as i64)
            .param("centroid", embedding_to_f64(&cluster.centroid))]
        })
        .await
    }

    /// Replace the unit's cluster membership. A unit belongs to at most one
    /// cluster at any time.
    pub async fn assign_cluster(
        &self,
        unit_id: &str,
        cluster_id: &str,
    ) -> Result<(), PodGraphError> {
        self.run_write_txn(|| {
            vec![query(
                "MATCH (u:MeaningfulUnit {id: $unit_id})
                 OPTIONAL MATCH (u)-[old:IN_CLUSTER]->(:Cluster)
                 DELETE old
                 WITH DISTINCT u
                 MATCH (c:Cluster {id: $cluster_id})
                 MERGE (u)-[:IN_CLUSTER]->(c)
                 SET c.member_count = c.member_count + 1",
            )
            .param("unit_id", unit_id)
            .param("cluster_id", cluster_id)]
        })
        .await
    }

    /// Rewrite a unit's speaker fields after post-processing.
    pub async fn update_unit_speakers(
        &self,
        unit_id: &str,
        primary_speaker: &str,
        speaker_distribution: &std::collections::HashMap<String, f64>,
    ) -> Result<(), PodGraphError> {
        self.run_write_txn(|| {
            vec![query(
                "MATCH (u:MeaningfulUnit {id: $id})
                 SET u.primary_speaker = $primary_speaker,
                     u.speaker_distribution = $speaker_distribution",
            )
            .param("id", unit_id)
            .param("primary_speaker", primary_speaker)
            .param(
                "speaker_distribution",
                serde_json::to_string(speaker_distribution).unwrap_or_default(),
            )]
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Admin
    // -----------------------------------------------------------------------

    /// Delete an episode and everything it owns: units, their quotes and
    /// insights, and entities left without any citing unit.
    pub async fn delete_episode(&self, episode_id: &str) -> Result<(), PodGraphError> {
        self.run_write_txn(|| {
            let cascade = query(
                "MATCH (e:Episode {id: $id})
                 OPTIONAL MATCH (u:MeaningfulUnit)-[:PART_OF]->(e)
                 OPTIONAL MATCH (q:Quote)-[:EXTRACTED_FROM]->(u)
                 OPTIONAL MATCH (i:Insight)-[:EXTRACTED_FROM]->(u)
                 DETACH DELETE q, i, u, e",
            )
            .param("id", episode_id);
            // Entities live as long as any unit cites them.
            let orphans = query(
                "MATCH (n:Entity) WHERE NOT (n)-[:MENTIONED_IN]->(:MeaningfulUnit) DETACH DELETE n",
            );
            vec![cascade, orphans]
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run the built queries in one write transaction, retrying the whole
    /// transaction on transient serialization errors and constraint races
    /// (the MERGE sees the winner's node on the retry and succeeds). The
    /// builder runs per attempt, so retries get fresh queries.
    async fn run_write_txn(&self, build: impl Fn() -> Vec<Query>) -> Result<(), PodGraphError> {
        let mut attempt = 0u32;
        loop {
            match self.try_txn(build()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    let mapped = map_db_err(e);
                    if attempt > MAX_TX_RETRIES || !mapped.is_transient() {
                        return Err(mapped);
                    }
                    let backoff = backoff_with_jitter(attempt);
                    warn!(
                        attempt,
                        error = %mapped,
                        backoff_ms = backoff.as_millis() as u64,
                        "write transaction failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn try_txn(&self, queries: Vec<Query>) -> Result<(), neo4rs::Error> {
        debug!(queries = queries.len(), "write transaction");
        let mut txn = self.client.graph.start_txn().await?;
        for q in queries {
            txn.run(q).await?;
        }
        txn.commit().await
    }
}

// ---------------------------------------------------------------------------
// Query builders
// ---------------------------------------------------------------------------

fn episode_query(episode: &Episode) -> Query {
    query(
        "MERGE (e:Episode {id: $id})
         ON CREATE SET e.created_at = datetime($now)
         SET e.podcast_id = $podcast_id,
             e.title = $title,
             e.published_date = $published_date,
             e.youtube_url = $youtube_url,
             e.vtt_path = $vtt_path,
             e.duration_seconds = $duration_seconds,
             e.processing_status = $status,
             e.updated_at = datetime($now)",
    )
    .param("id", episode.id.as_str())
    .param("podcast_id", episode.podcast_id.as_str())
    .param("title", episode.title.as_str())
    .param("published_date", episode.published_date.as_str())
    .param("youtube_url", episode.youtube_url.clone().unwrap_or_default())
    .param("vtt_path", episode.vtt_path.as_str())
    .param("duration_seconds", episode.duration_seconds)
    .param("status", episode.processing_status.to_string())
    .param("now", format_datetime(&Utc::now()))
}

fn unit_query(unit: &MeaningfulUnit, episode_id: &str) -> Query {
    query(
        "MERGE (u:MeaningfulUnit {id: $id})
         ON CREATE SET u.created_at = datetime($now)
         SET u.episode_id = $episode_id,
             u.start_sec = $start_sec,
             u.end_sec = $end_sec,
             u.text = $text,
             u.unit_type = $unit_type,
             u.summary = $summary,
             u.themes = $themes,
             u.primary_speaker = $primary_speaker,
             u.speaker_distribution = $speaker_distribution,
             u.completeness = $completeness,
             u.segment_indices = $segment_indices,
             u.embedding = $embedding
         WITH u
         MATCH (e:Episode {id: $episode_id})
         MERGE (u)-[:PART_OF]->(e)",
    )
    .param("id", unit.id.as_str())
    .param("episode_id", episode_id)
    .param("start_sec", unit.start_sec)
    .param("end_sec", unit.end_sec)
    .param("text", unit.text.as_str())
    .param("unit_type", unit.unit_type.to_string())
    .param("summary", unit.summary.as_str())
    .param("themes", unit.themes.clone())
    .param("primary_speaker", unit.primary_speaker.as_str())
    .param(
        "speaker_distribution",
        serde_json::to_string(&unit.speaker_distribution).unwrap_or_default(),
    )
    .param("completeness", unit.completeness.to_string())
    .param(
        "segment_indices",
        unit.segment_indices
            .iter()
            .map(|i| *i as i64)
            .collect::<Vec<i64>>(),
    )
    .param(
        "embedding",
        unit.embedding
            .as_deref()
            .map(embedding_to_f64)
            .unwrap_or_default(),
    )
    .param("now", format_datetime(&Utc::now()))
}

fn entity_query(entity: &Entity, mention: &Mention, unit_id: &str) -> Query {
    let mut aliases = entity.aliases.clone();
    if !aliases.contains(&entity.name) {
        aliases.push(entity.name.clone());
    }
    query(
        "MERGE (n:Entity {id: $id})
         ON CREATE SET n.name = $name,
                       n.first_seen_unit_id = $unit_id,
                       n.importance = $importance,
                       n.aliases = $aliases
         ON MATCH SET n.importance = CASE WHEN n.importance < $importance
                                          THEN $importance ELSE n.importance END,
                      n.aliases = reduce(acc = n.aliases, a IN $aliases |
                                         CASE WHEN a IN acc THEN acc ELSE acc + a END)
         SET n.canonical_name = $canonical_name,
             n.type = $type,
             n.description = $description
         WITH n
         MATCH (u:MeaningfulUnit {id: $unit_id})
         MERGE (n)-[m:MENTIONED_IN]->(u)
         SET m.context = $context, m.frequency = $frequency, m.importance = $mention_importance",
    )
    .param("id", entity.id.as_str())
    .param("name", entity.name.as_str())
    .param("canonical_name", entity.canonical_name.as_str())
    .param("type", entity.entity_type.to_string())
    .param("description", entity.description.as_str())
    .param("importance", entity.importance as i64)
    .param("aliases", aliases)
    .param("unit_id", unit_id)
    .param("context", mention.context.as_str())
    .param("frequency", mention.frequency as i64)
    .param("mention_importance", mention.importance as i64)
}

fn quote_query(quote: &Quote, unit_id: &str) -> Query {
    query(
        "MERGE (q:Quote {id: $id})
         SET q.text = $text,
             q.speaker = $speaker,
             q.context = $context,
             q.is_memorable = $is_memorable,
             q.theme = $theme
         WITH q
         MATCH (u:MeaningfulUnit {id: $unit_id})
         MERGE (q)-[:EXTRACTED_FROM]->(u)",
    )
    .param("id", quote.id.as_str())
    .param("text", quote.text.as_str())
    .param("speaker", quote.speaker.as_str())
    .param("context", quote.context.as_str())
    .param("is_memorable", quote.is_memorable)
    .param("theme", quote.theme.clone().unwrap_or_default())
    .param("unit_id", unit_id)
}

fn insight_query(insight: &Insight, unit_id: &str) -> Query {
    query(
        "MERGE (i:Insight {id: $id})
         SET i.title = $title,
             i.description = $description,
             i.insight_type = $insight_type,
             i.confidence = $confidence
         WITH i
         MATCH (u:MeaningfulUnit {id: $unit_id})
         MERGE (i)-[:EXTRACTED_FROM]->(u)",
    )
    .param("id", insight.id.as_str())
    .param("title", insight.title.as_str())
    .param("description", insight.description.as_str())
    .param("insight_type", insight.insight_type.to_string())
    .param("confidence", insight.confidence as i64)
    .param("unit_id", unit_id)
}

fn supported_by_query(insight_id: &str, entity_id: &str) -> Query {
    query(
        "MATCH (i:Insight {id: $insight_id}), (n:Entity {id: $entity_id})
         MERGE (i)-[:SUPPORTED_BY]->(n)",
    )
    .param("insight_id", insight_id)
    .param("entity_id", entity_id)
}

fn relationship_query(rel: &EntityRelationship, src_id: &str, dst_id: &str) -> Query {
    query(
        "MATCH (a:Entity {id: $src}), (b:Entity {id: $dst})
         MERGE (a)-[r:RELATES_TO {type: $type}]->(b)
         ON CREATE SET r.first_seen_unit_id = $unit_id
         SET r.description = $description,
             r.confidence = $confidence,
             r.evidence = $evidence,
             r.source_unit_id = $unit_id",
    )
    .param("src", src_id)
    .param("dst", dst_id)
    .param("type", rel.relationship_type.as_str())
    .param("description", rel.description.as_str())
    .param("confidence", rel.confidence as i64)
    .param("evidence", rel.evidence.clone().unwrap_or_default())
    .param("unit_id", rel.source_unit_id.as_str())
}

/// All queries for one unit, in dependency order.
fn unit_knowledge_queries(unit: &MeaningfulUnit, knowledge: &UnitKnowledge) -> Vec<Query> {
    let mut queries = vec![unit_query(unit, &unit.episode_id)];

    for (entity, mention) in &knowledge.entities {
        queries.push(entity_query(entity, mention, &unit.id));
    }
    for quote in &knowledge.quotes {
        queries.push(quote_query(quote, &unit.id));
    }
    for insight in &knowledge.insights {
        queries.push(insight_query(insight, &unit.id));
        for supporting in &insight.supporting_entities {
            if let Some(entity_id) = find_entity_id(knowledge, supporting) {
                queries.push(supported_by_query(&insight.id, entity_id));
            }
        }
    }
    for rel in &knowledge.relationships {
        let src = find_entity_id(knowledge, &rel.source_entity);
        let dst = find_entity_id(knowledge, &rel.target_entity);
        match (src, dst) {
            (Some(src), Some(dst)) if src != dst => {
                queries.push(relationship_query(rel, src, dst));
            }
            _ => {
                // Relationship references an entity the extractor did not
                // return; drop it rather than invent a node.
                debug!(
                    source = rel.source_entity.as_str(),
                    target = rel.target_entity.as_str(),
                    "relationship endpoint not in unit entities, skipped"
                );
            }
        }
    }
    queries
}

fn find_entity_id<'a>(knowledge: &'a UnitKnowledge, name: &str) -> Option<&'a str> {
    let canonical = podgraph_common::canonical_name(name);
    knowledge
        .entities
        .iter()
        .find(|(e, _)| e.canonical_name == canonical)
        .map(|(e, _)| e.id.as_str())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn embedding_to_f64(embedding: &[f32]) -> Vec<f64> {
    embedding.iter().map(|v| *v as f64).collect()
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 100u64 * 2u64.saturating_pow(attempt - 1);
    let jitter = rand::rng().random_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

/// Map driver errors onto the taxonomy. Constraint races are transient (the
/// retried MERGE sees the existing node); everything else on the wire is
/// storage unavailability.
fn map_db_err(e: neo4rs::Error) -> PodGraphError {
    let msg = e.to_string();
    if msg.contains("Constraint") || msg.contains("constraint") || msg.contains("already exists") {
        PodGraphError::ConstraintConflict(msg)
    } else {
        PodGraphError::StorageUnavailable(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podgraph_common::types::*;

    fn sample_unit() -> MeaningfulUnit {
        MeaningfulUnit {
            id: "u1".into(),
            episode_id: "ep1".into(),
            start_sec: 0.0,
            end_sec: 10.0,
            text: "hello".into(),
            unit_type: UnitType::Other,
            summary: "greeting".into(),
            themes: vec![],
            primary_speaker: "Host".into(),
            speaker_distribution: [("Host".to_string(), 100.0)].into_iter().collect(),
            completeness: Completeness::Complete,
            segment_indices: vec![0],
            embedding: None,
            created_at: Utc::now(),
        }
    }

    fn sample_entity(name: &str) -> (Entity, Mention) {
        let canonical = podgraph_common::canonical_name(name);
        let id = podgraph_common::entity_id(&canonical, "Person");
        (
            Entity {
                id,
                name: name.to_string(),
                canonical_name: canonical,
                entity_type: EntityType::Person,
                description: String::new(),
                importance: 5,
                first_seen_unit_id: "u1".into(),
                aliases: vec![],
            },
            Mention {
                context: "ctx".into(),
                frequency: 1,
                importance: 5,
            },
        )
    }

    #[test]
    fn write_count_matches_query_count_shape() {
        let mut knowledge = UnitKnowledge::default();
        knowledge.entities.push(sample_entity("Alice"));
        knowledge.entities.push(sample_entity("Bob"));
        knowledge.quotes.push(Quote {
            id: "q1".into(),
            text: "a quote long enough".into(),
            speaker: "Alice".into(),
            context: "c".into(),
            is_memorable: true,
            theme: None,
        });
        knowledge.insights.push(Insight {
            id: "i1".into(),
            title: "t".into(),
            description: "d".into(),
            insight_type: InsightType::Conceptual,
            confidence: 7,
            supporting_entities: vec!["Alice".into()],
        });
        knowledge.relationships.push(EntityRelationship {
            source_entity: "Alice".into(),
            target_entity: "Bob".into(),
            relationship_type: "knows".into(),
            description: String::new(),
            confidence: 6,
            evidence: None,
            source_unit_id: "u1".into(),
        });

        let queries = unit_knowledge_queries(&sample_unit(), &knowledge);
        // unit + 2 entities + quote + insight + supported_by + relationship
        assert_eq!(queries.len(), 7);
        assert!(knowledge.write_count() >= queries.len());
    }

    #[test]
    fn relationship_with_unknown_endpoint_is_skipped() {
        let mut knowledge = UnitKnowledge::default();
        knowledge.entities.push(sample_entity("Alice"));
        knowledge.relationships.push(EntityRelationship {
            source_entity: "Alice".into(),
            target_entity: "Nobody".into(),
            relationship_type: "knows".into(),
            description: String::new(),
            confidence: 5,
            evidence: None,
            source_unit_id: "u1".into(),
        });
        let queries = unit_knowledge_queries(&sample_unit(), &knowledge);
        // unit + entity only
        assert_eq!(queries.len(), 2);
    }

    #[test]
    fn self_relationship_is_skipped() {
        let mut knowledge = UnitKnowledge::default();
        knowledge.entities.push(sample_entity("Alice"));
        knowledge.relationships.push(EntityRelationship {
            source_entity: "Alice".into(),
            target_entity: "alice".into(),
            relationship_type: "is".into(),
            description: String::new(),
            confidence: 5,
            evidence: None,
            source_unit_id: "u1".into(),
        });
        let queries = unit_knowledge_queries(&sample_unit(), &knowledge);
        assert_eq!(queries.len(), 2);
    }
}
