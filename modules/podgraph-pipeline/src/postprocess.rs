//! Post-ingest passes, run once per episode after persist.
//!
//! Speaker disambiguation is strictly episode-scoped: the mapping prompt
//! sees only this episode's labels, and nothing is cached across episodes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ai_client::{schema_of, LlmProvider, StructuredCall};
use podgraph_common::error::PodGraphError;
use podgraph_graph::reader::UnitSpeakers;
use podgraph_graph::{ClusterAssigner, GraphRouter};

use crate::llm::{estimate_tokens, leased_call};
use crate::rotation::CredentialRotator;

/// Seam the orchestrator depends on; mocked in tests.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// The `cluster` stage: nearest-centroid assignment for the episode.
    async fn run_cluster_stage(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<(), PodGraphError>;

    /// The `analyze` stage: speaker consolidation plus the knowledge-gap,
    /// diversity and missing-link analyses.
    async fn run_analyze_stage(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<(), PodGraphError>;
}

// ---------------------------------------------------------------------------
// Speaker mapping
// ---------------------------------------------------------------------------

const SPEAKER_SYSTEM_PROMPT: &str = "You consolidate speaker labels from a podcast episode \
transcript. Given the raw labels and how much each speaks, map diarization artifacts \
(\"Speaker 1\", \"SPEAKER_00\") and spelling variants onto one canonical label per actual \
person. Only map labels you are given; never invent names not derivable from the labels.";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SpeakerMapping {
    #[serde(default)]
    pub mappings: Vec<SpeakerAlias>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SpeakerAlias {
    pub from: String,
    pub to: String,
}

/// Whether a label looks like a diarization artifact worth consolidating.
pub fn is_generic_label(label: &str) -> bool {
    let lower = label.trim().to_lowercase();
    if lower == "unknown" {
        return true;
    }
    let stripped = lower
        .strip_prefix("speaker")
        .or_else(|| lower.strip_prefix("spk"));
    match stripped {
        Some(rest) => {
            let rest = rest.trim_start_matches(['_', ' ', '-']);
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Remap a speaker distribution, merging shares that land on the same
/// canonical label.
pub fn apply_mapping(
    distribution: &HashMap<String, f64>,
    mapping: &HashMap<String, String>,
) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    for (speaker, share) in distribution {
        let target = mapping.get(speaker).unwrap_or(speaker);
        *out.entry(target.clone()).or_insert(0.0) += share;
    }
    for share in out.values_mut() {
        *share = (*share * 10.0).round() / 10.0;
    }
    out
}

pub struct SpeakerMapper {
    llm: Arc<dyn LlmProvider>,
    rotator: Arc<CredentialRotator>,
}

impl SpeakerMapper {
    pub fn new(llm: Arc<dyn LlmProvider>, rotator: Arc<CredentialRotator>) -> Self {
        Self { llm, rotator }
    }

    /// Consolidation mapping for one episode's labels. Empty when there is
    /// nothing generic to consolidate or the LLM pass fails; callers treat
    /// the pass as best-effort.
    pub async fn mapping_for(&self, units: &[UnitSpeakers]) -> HashMap<String, String> {
        let mut airtime: HashMap<String, f64> = HashMap::new();
        for unit in units {
            for (speaker, share) in &unit.distribution {
                *airtime.entry(speaker.clone()).or_insert(0.0) += share;
            }
        }
        if airtime.is_empty() || !airtime.keys().any(|l| is_generic_label(l)) {
            return HashMap::new();
        }

        let mut labels: Vec<(&String, &f64)> = airtime.iter().collect();
        labels.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        let label_summary: String = labels
            .iter()
            .map(|(label, share)| format!("- \"{label}\" ({share:.1} share)"))
            .collect::<Vec<_>>()
            .join("\n");
        let user_prompt = format!(
            "Speaker labels from one episode, with total speaking share:\n{label_summary}\n\n\
             Return mappings that consolidate labels referring to the same person. Omit labels \
             that are already canonical."
        );

        let schema = schema_of::<SpeakerMapping>();
        let call = StructuredCall::new(SPEAKER_SYSTEM_PROMPT, &user_prompt, schema)
            .temperature(0.0)
            .max_tokens(1024);
        let est = estimate_tokens(&user_prompt) + 256;

        let outcome = leased_call(&self.rotator, est, |lease| async {
            let result = self
                .llm
                .extract_structured(&lease.api_key, &call)
                .await
                .and_then(|reply| {
                    let tokens = reply.total_tokens().max(est);
                    reply.parse::<SpeakerMapping>().map(|v| (v, tokens))
                });
            (lease, result)
        })
        .await;

        match outcome {
            Ok(mapping) => {
                let known: std::collections::HashSet<&String> = airtime.keys().collect();
                mapping
                    .mappings
                    .into_iter()
                    .filter(|m| known.contains(&m.from) && m.from != m.to)
                    .map(|m| (m.from, m.to))
                    .collect()
            }
            Err(e) => {
                warn!(error = %e.into_pipeline_error(), "speaker mapping pass failed");
                HashMap::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Graph-backed post-processor
// ---------------------------------------------------------------------------

pub struct GraphPostProcessor {
    router: Arc<GraphRouter>,
    speaker_mapper: SpeakerMapper,
    assign_threshold: f64,
}

impl GraphPostProcessor {
    pub fn new(
        router: Arc<GraphRouter>,
        llm: Arc<dyn LlmProvider>,
        rotator: Arc<CredentialRotator>,
        assign_threshold: f64,
    ) -> Self {
        Self {
            router,
            speaker_mapper: SpeakerMapper::new(llm, rotator),
            assign_threshold,
        }
    }
}

#[async_trait]
impl PostProcessor for GraphPostProcessor {
    async fn run_cluster_stage(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<(), PodGraphError> {
        let reader = self.router.reader_for(podcast_id).await?;
        let store = self.router.store_for(podcast_id).await?;
        ClusterAssigner::new(self.assign_threshold)
            .assign_episode(&reader, &store, episode_id)
            .await?;
        Ok(())
    }

    async fn run_analyze_stage(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<(), PodGraphError> {
        let reader = self.router.reader_for(podcast_id).await?;
        let store = self.router.store_for(podcast_id).await?;

        // Speaker consolidation, strictly within this episode.
        let units = reader.episode_unit_speakers(episode_id).await?;
        let mapping = self.speaker_mapper.mapping_for(&units).await;
        if !mapping.is_empty() {
            info!(episode_id, mappings = mapping.len(), "consolidating speakers");
            for unit in &units {
                let remapped = apply_mapping(&unit.distribution, &mapping);
                let primary = mapping
                    .get(&unit.primary_speaker)
                    .cloned()
                    .unwrap_or_else(|| unit.primary_speaker.clone());
                store
                    .update_unit_speakers(&unit.unit_id, &primary, &remapped)
                    .await?;
            }
        } else {
            debug!(episode_id, "no speaker consolidation needed");
        }

        // Graph-wide analyses, refreshed after each episode lands.
        let gaps = reader.knowledge_gaps(7, 2, 25).await?;
        reader.write_analysis("knowledge_gaps", podcast_id, &gaps).await?;

        let diversity = reader.diversity().await?;
        reader.write_analysis("diversity", podcast_id, &diversity).await?;

        let links = reader.missing_links(2, 25).await?;
        reader.write_analysis("missing_links", podcast_id, &links).await?;

        info!(
            episode_id,
            gaps = gaps.len(),
            missing_links = links.len(),
            entity_types = diversity.by_type.len(),
            "post-ingest analyses written"
        );
        Ok(())
    }
}
