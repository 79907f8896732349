//! Combined single-pass knowledge extraction.
//!
//! One LLM call per MeaningfulUnit returns entities, quotes, insights,
//! relationships and a short conversation analysis together. The system
//! prompt is stable so provider-side context caching applies across units;
//! only the user prompt varies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ai_client::{schema_of, LlmProvider, StructuredCall};
use podgraph_common::error::PodGraphError;
use podgraph_common::types::{Completeness, EntityType, InsightType, MeaningfulUnit};
use podgraph_common::{canonical_name, entity_id, insight_id, quote_id};
use podgraph_graph::UnitKnowledge;

use crate::llm::{estimate_tokens, leased_call};
use crate::rotation::CredentialRotator;
use crate::EpisodeContext;

/// Quotes shorter than this are noise, not quotes.
const MIN_QUOTE_CHARS: usize = 20;

const SYSTEM_PROMPT: &str = "You are a knowledge extraction system for podcast transcripts. \
From a single conversation unit you extract, in one pass: named entities (people, \
organizations, concepts, technologies, works, medical terms, places, events), memorable and \
substantive quotes, insights (actionable, conceptual, experiential, predictive, analytical), \
relationships between the entities you found, and a brief analysis of the conversation \
within the unit. Be precise: only extract what the text supports, keep descriptions to one \
sentence, and prefer fewer high-quality items over many weak ones.";

// ---------------------------------------------------------------------------
// LLM wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CombinedPayload {
    #[serde(default)]
    pub entities: Vec<WireEntity>,
    #[serde(default)]
    pub quotes: Vec<WireQuote>,
    #[serde(default)]
    pub insights: Vec<WireInsight>,
    #[serde(default)]
    pub relationships: Vec<WireRelationship>,
    #[serde(default)]
    pub conversation_analysis: Option<WireAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireEntity {
    pub name: String,
    /// Free-form type label; folded onto the canonical vocabulary later.
    #[serde(rename = "type")]
    pub type_label: String,
    #[serde(default)]
    pub description: String,
    /// 1-10.
    #[serde(default = "default_score")]
    pub importance: f64,
    /// Number of mentions within the unit.
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub has_citation: bool,
    #[serde(default)]
    pub context_snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireQuote {
    pub text: String,
    pub speaker: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub is_memorable: bool,
    #[serde(default)]
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireInsight {
    /// Brief 3-5 word title.
    pub title: String,
    /// One sentence description.
    pub description: String,
    /// actionable, conceptual, experiential, predictive, or analytical.
    #[serde(default)]
    pub insight_type: String,
    /// 1-10.
    #[serde(default = "default_score")]
    pub confidence: f64,
    #[serde(default)]
    pub supporting_entities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireRelationship {
    pub source_entity: String,
    pub target_entity: String,
    /// e.g. works_for, created_by, influences. Open vocabulary.
    pub relationship_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_score")]
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WireAnalysis {
    #[serde(default)]
    pub topic_summary: String,
    /// complete, incomplete, or fragmented.
    #[serde(default)]
    pub completeness: String,
    #[serde(default)]
    pub key_themes: Vec<String>,
    /// speaker name → role description.
    #[serde(default)]
    pub speaker_dynamics: HashMap<String, String>,
    #[serde(default)]
    pub structural_notes: Option<String>,
}

fn default_score() -> f64 {
    5.0
}

fn default_frequency() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
    pub importance: u8,
    pub frequency: u32,
    pub has_citation: bool,
    pub context_snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedQuote {
    pub text: String,
    pub speaker: String,
    pub context: String,
    pub is_memorable: bool,
    pub theme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInsight {
    pub title: String,
    pub description: String,
    pub insight_type: InsightType,
    pub confidence: u8,
    pub supporting_entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source_entity: String,
    pub target_entity: String,
    pub relationship_type: String,
    pub description: String,
    pub confidence: u8,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub topic_summary: String,
    pub completeness: Option<Completeness>,
    pub key_themes: Vec<String>,
    pub speaker_dynamics: HashMap<String, String>,
    pub structural_notes: Option<String>,
}

/// Everything one LLM pass produced for a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedExtraction {
    pub unit_id: String,
    pub entities: Vec<ExtractedEntity>,
    pub quotes: Vec<ExtractedQuote>,
    pub insights: Vec<ExtractedInsight>,
    pub relationships: Vec<ExtractedRelationship>,
    pub conversation_analysis: ConversationAnalysis,
    pub extraction_timestamp: DateTime<Utc>,
    pub token_count: Option<u32>,
    pub processing_time_ms: Option<u64>,
}

impl CombinedExtraction {
    pub fn empty(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            entities: Vec::new(),
            quotes: Vec::new(),
            insights: Vec::new(),
            relationships: Vec::new(),
            conversation_analysis: ConversationAnalysis::default(),
            extraction_timestamp: Utc::now(),
            token_count: None,
            processing_time_ms: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.quotes.is_empty()
            && self.insights.is_empty()
            && self.relationships.is_empty()
    }
}

/// Seam the orchestrator depends on; mocked in tests.
#[async_trait]
pub trait UnitExtractor: Send + Sync {
    async fn extract(
        &self,
        unit: &MeaningfulUnit,
        ctx: &EpisodeContext,
    ) -> Result<CombinedExtraction, PodGraphError>;
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct Extractor {
    llm: Arc<dyn LlmProvider>,
    rotator: Arc<CredentialRotator>,
    max_retries: u32,
    max_output_tokens: u32,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LlmProvider>, rotator: Arc<CredentialRotator>) -> Self {
        Self {
            llm,
            rotator,
            max_retries: 3,
            max_output_tokens: 4096,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl UnitExtractor for Extractor {
    async fn extract(
        &self,
        unit: &MeaningfulUnit,
        ctx: &EpisodeContext,
    ) -> Result<CombinedExtraction, PodGraphError> {
        if unit.text.trim().is_empty() {
            debug!(unit_id = unit.id.as_str(), "empty unit text, skipping LLM");
            return Ok(CombinedExtraction::empty(&unit.id));
        }

        let schema = schema_of::<CombinedPayload>();
        let base_prompt = build_user_prompt(unit, ctx, &schema);
        let started = std::time::Instant::now();

        let mut prompt = base_prompt.clone();
        let mut attempt = 0;
        let mut repaired = false;
        loop {
            let call = StructuredCall::new(SYSTEM_PROMPT, &prompt, schema.clone())
                .temperature(0.2)
                .max_tokens(self.max_output_tokens);
            let est = estimate_tokens(&prompt) + self.max_output_tokens / 2;

            let outcome = leased_call(&self.rotator, est, |lease| async {
                let result = self
                    .llm
                    .extract_structured(&lease.api_key, &call)
                    .await
                    .and_then(|reply| {
                        let tokens = reply.total_tokens().max(1);
                        reply
                            .parse::<CombinedPayload>()
                            .map(|v| ((v, tokens), tokens))
                    });
                (lease, result)
            })
            .await;

            match outcome {
                Ok((payload, tokens)) => {
                    let mut extraction = normalize_payload(payload, &unit.id);
                    extraction.token_count = Some(tokens);
                    extraction.processing_time_ms = Some(started.elapsed().as_millis() as u64);
                    debug!(
                        unit_id = unit.id.as_str(),
                        entities = extraction.entities.len(),
                        quotes = extraction.quotes.len(),
                        insights = extraction.insights.len(),
                        relationships = extraction.relationships.len(),
                        "unit extraction complete"
                    );
                    return Ok(extraction);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(unit_id = unit.id.as_str(), attempt, "extraction retry");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        300 * 2u64.pow(attempt - 1),
                    ))
                    .await;
                }
                Err(e) if e.is_invalid_response() && !repaired => {
                    repaired = true;
                    warn!(unit_id = unit.id.as_str(), "malformed extraction, repair retry");
                    prompt =
                        format!("{base_prompt}\n\nReturn ONLY valid JSON matching the schema.");
                }
                Err(e) => return Err(e.into_pipeline_error()),
            }
        }
    }
}

fn build_user_prompt(
    unit: &MeaningfulUnit,
    ctx: &EpisodeContext,
    schema: &serde_json::Value,
) -> String {
    format!(
        "PODCAST: {podcast}\nEPISODE: {title}\nPUBLISHED: {date}\n\
         UNIT: {unit_type}, {start} - {end}\nSUMMARY: {summary}\n\n\
         CONVERSATION UNIT (format: [speaker MM:SS] text):\n{text}\n\n\
         Extract all entities, quotes, insights and relationships from this unit, plus a \
         short conversation analysis, as a JSON object matching this schema:\n{schema}",
        podcast = ctx.podcast_name,
        title = ctx.episode_title,
        date = ctx.published_date,
        unit_type = unit.unit_type,
        start = crate::structurer::format_mm_ss(unit.start_sec),
        end = crate::structurer::format_mm_ss(unit.end_sec),
        summary = unit.summary,
        text = unit.text,
    )
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Clamp a score to [1,10]. Values strictly below 1.0 are treated as a 0-1
/// scale and re-based first.
pub(crate) fn clamp_score(raw: f64) -> u8 {
    let scaled = if raw > 0.0 && raw < 1.0 { raw * 10.0 } else { raw };
    scaled.round().clamp(1.0, 10.0) as u8
}

/// Apply the extractor edge policies: clamp scores, merge intra-unit
/// duplicate entities, drop short quotes.
pub fn normalize_payload(payload: CombinedPayload, unit_id: &str) -> CombinedExtraction {
    // Merge duplicates by (canonicalName, folded type): frequencies add,
    // importance takes the max, first description and snippet win.
    let mut merged: Vec<ExtractedEntity> = Vec::new();
    let mut index: HashMap<(String, EntityType), usize> = HashMap::new();
    for wire in payload.entities {
        let name = wire.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let entity_type = EntityType::fold(&wire.type_label);
        let key = (canonical_name(&name), entity_type);
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.frequency += wire.frequency.max(1);
                existing.importance = existing.importance.max(clamp_score(wire.importance));
                existing.has_citation |= wire.has_citation;
                if existing.context_snippet.is_none() {
                    existing.context_snippet = wire.context_snippet;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(ExtractedEntity {
                    name,
                    entity_type,
                    description: wire.description,
                    importance: clamp_score(wire.importance),
                    frequency: wire.frequency.max(1),
                    has_citation: wire.has_citation,
                    context_snippet: wire.context_snippet,
                });
            }
        }
    }

    let quotes = payload
        .quotes
        .into_iter()
        .filter(|q| q.text.trim().len() >= MIN_QUOTE_CHARS)
        .map(|q| ExtractedQuote {
            text: q.text.trim().to_string(),
            speaker: q.speaker,
            context: q.context,
            is_memorable: q.is_memorable,
            theme: q.theme,
        })
        .collect();

    let insights = payload
        .insights
        .into_iter()
        .filter(|i| !i.title.trim().is_empty())
        .map(|i| ExtractedInsight {
            title: i.title.trim().to_string(),
            description: i.description,
            insight_type: InsightType::parse_lenient(&i.insight_type),
            confidence: clamp_score(i.confidence),
            supporting_entities: i.supporting_entities,
        })
        .collect();

    let relationships = payload
        .relationships
        .into_iter()
        .filter(|r| {
            !r.source_entity.trim().is_empty()
                && !r.target_entity.trim().is_empty()
                && !r.relationship_type.trim().is_empty()
        })
        .map(|r| ExtractedRelationship {
            source_entity: r.source_entity,
            target_entity: r.target_entity,
            relationship_type: r.relationship_type.trim().to_lowercase().replace(' ', "_"),
            description: r.description,
            confidence: clamp_score(r.confidence),
            evidence: r.evidence,
        })
        .collect();

    let analysis = payload
        .conversation_analysis
        .map(|a| ConversationAnalysis {
            topic_summary: a.topic_summary,
            completeness: match a.completeness.trim() {
                "" => None,
                other => Some(Completeness::parse_lenient(other)),
            },
            key_themes: a.key_themes,
            speaker_dynamics: a.speaker_dynamics,
            structural_notes: a.structural_notes,
        })
        .unwrap_or_default();

    CombinedExtraction {
        unit_id: unit_id.to_string(),
        entities: merged,
        quotes,
        insights,
        relationships,
        conversation_analysis: analysis,
        extraction_timestamp: Utc::now(),
        token_count: None,
        processing_time_ms: None,
    }
}

/// Resolve an extraction to persistable knowledge: stable ids everywhere,
/// relationships still as name tuples for the store to resolve.
pub fn resolve_knowledge(extraction: &CombinedExtraction, unit_id: &str) -> UnitKnowledge {
    use podgraph_common::types::{Entity, EntityRelationship, Insight, Mention, Quote};

    let entities = extraction
        .entities
        .iter()
        .map(|e| {
            let canonical = canonical_name(&e.name);
            let id = entity_id(&canonical, e.entity_type.as_str());
            (
                Entity {
                    id,
                    name: e.name.clone(),
                    canonical_name: canonical,
                    entity_type: e.entity_type,
                    description: e.description.clone(),
                    importance: e.importance,
                    first_seen_unit_id: unit_id.to_string(),
                    aliases: Vec::new(),
                },
                Mention {
                    context: e
                        .context_snippet
                        .clone()
                        .unwrap_or_else(|| e.description.clone()),
                    frequency: e.frequency,
                    importance: e.importance,
                },
            )
        })
        .collect();

    let quotes = extraction
        .quotes
        .iter()
        .map(|q| Quote {
            id: quote_id(unit_id, &q.text),
            text: q.text.clone(),
            speaker: q.speaker.clone(),
            context: q.context.clone(),
            is_memorable: q.is_memorable,
            theme: q.theme.clone(),
        })
        .collect();

    let insights = extraction
        .insights
        .iter()
        .map(|i| Insight {
            id: insight_id(unit_id, &i.title),
            title: i.title.clone(),
            description: i.description.clone(),
            insight_type: i.insight_type,
            confidence: i.confidence,
            supporting_entities: i.supporting_entities.clone(),
        })
        .collect();

    let relationships = extraction
        .relationships
        .iter()
        .map(|r| EntityRelationship {
            source_entity: r.source_entity.clone(),
            target_entity: r.target_entity.clone(),
            relationship_type: r.relationship_type.clone(),
            description: r.description.clone(),
            confidence: r.confidence,
            evidence: r.evidence.clone(),
            source_unit_id: unit_id.to_string(),
        })
        .collect();

    UnitKnowledge {
        entities,
        quotes,
        insights,
        relationships,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_entity(name: &str, type_label: &str, importance: f64, frequency: u32) -> WireEntity {
        WireEntity {
            name: name.to_string(),
            type_label: type_label.to_string(),
            description: format!("{name} description"),
            importance,
            frequency,
            has_citation: false,
            context_snippet: None,
        }
    }

    #[test]
    fn clamp_score_handles_both_scales() {
        assert_eq!(clamp_score(0.7), 7);
        assert_eq!(clamp_score(7.0), 7);
        assert_eq!(clamp_score(15.0), 10);
        assert_eq!(clamp_score(0.0), 1);
        assert_eq!(clamp_score(-3.0), 1);
        assert_eq!(clamp_score(1.0), 1);
        assert_eq!(clamp_score(0.95), 10);
    }

    #[test]
    fn duplicate_entities_merge_with_summed_frequency() {
        let payload = CombinedPayload {
            entities: vec![
                wire_entity("OpenAI", "Company", 6.0, 2),
                wire_entity("openai", "organization", 8.0, 3),
                wire_entity("Sam Altman", "Person", 7.0, 1),
            ],
            ..Default::default()
        };
        let extraction = normalize_payload(payload, "u1");
        assert_eq!(extraction.entities.len(), 2);
        let openai = extraction
            .entities
            .iter()
            .find(|e| canonical_name(&e.name) == "openai")
            .unwrap();
        assert_eq!(openai.frequency, 5);
        assert_eq!(openai.importance, 8);
        assert_eq!(openai.entity_type, EntityType::Company);
    }

    #[test]
    fn short_quotes_are_dropped() {
        let payload = CombinedPayload {
            quotes: vec![
                WireQuote {
                    text: "Too short.".to_string(),
                    speaker: "A".to_string(),
                    context: String::new(),
                    is_memorable: true,
                    theme: None,
                },
                WireQuote {
                    text: "This quote is comfortably long enough to keep.".to_string(),
                    speaker: "B".to_string(),
                    context: String::new(),
                    is_memorable: false,
                    theme: None,
                },
            ],
            ..Default::default()
        };
        let extraction = normalize_payload(payload, "u1");
        assert_eq!(extraction.quotes.len(), 1);
        assert!(extraction.quotes[0].text.contains("comfortably"));
    }

    #[test]
    fn relationship_types_are_normalized() {
        let payload = CombinedPayload {
            relationships: vec![WireRelationship {
                source_entity: "A".into(),
                target_entity: "B".into(),
                relationship_type: "Works For".into(),
                description: String::new(),
                confidence: 0.9,
                evidence: None,
            }],
            ..Default::default()
        };
        let extraction = normalize_payload(payload, "u1");
        assert_eq!(extraction.relationships[0].relationship_type, "works_for");
        assert_eq!(extraction.relationships[0].confidence, 9);
    }

    #[test]
    fn unknown_entity_types_fold_to_other() {
        let payload = CombinedPayload {
            entities: vec![wire_entity("Thing", "Whatsit", 5.0, 1)],
            ..Default::default()
        };
        let extraction = normalize_payload(payload, "u1");
        assert_eq!(extraction.entities[0].entity_type, EntityType::Other);
    }

    #[test]
    fn resolve_knowledge_assigns_stable_ids() {
        let payload = CombinedPayload {
            entities: vec![wire_entity("Andrew Huberman", "Person", 9.0, 2)],
            insights: vec![WireInsight {
                title: "Morning light matters".into(),
                description: "Sunlight anchors circadian rhythm.".into(),
                insight_type: "actionable".into(),
                confidence: 8.0,
                supporting_entities: vec!["Andrew Huberman".into()],
            }],
            ..Default::default()
        };
        let extraction = normalize_payload(payload, "u1");
        let knowledge = resolve_knowledge(&extraction, "u1");
        let knowledge2 = resolve_knowledge(&extraction, "u1");
        assert_eq!(knowledge.entities[0].0.id, knowledge2.entities[0].0.id);
        assert_eq!(
            knowledge.entities[0].0.id,
            entity_id(&canonical_name("Andrew Huberman"), "Person")
        );
        assert_eq!(knowledge.insights[0].id, insight_id("u1", "Morning light matters"));
        assert_eq!(knowledge.insights[0].supporting_entities, vec!["Andrew Huberman"]);
    }

    #[test]
    fn payload_tolerates_missing_fields() {
        // Themes repurposed from the old Topic system may arrive empty, and
        // whole sections may be absent.
        let parsed: CombinedPayload = serde_json::from_value(serde_json::json!({
            "entities": [{"name": "X", "type": "Concept"}],
        }))
        .unwrap();
        let extraction = normalize_payload(parsed, "u1");
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].importance, 5);
        assert!(extraction.conversation_analysis.key_themes.is_empty());
    }

    #[tokio::test]
    async fn empty_unit_text_skips_the_llm() {
        struct PanickingLlm;
        #[async_trait]
        impl LlmProvider for PanickingLlm {
            fn model(&self) -> &str {
                "test"
            }
            async fn extract_structured(
                &self,
                _api_key: &str,
                _call: &StructuredCall,
            ) -> Result<ai_client::StructuredReply, ai_client::ProviderError> {
                panic!("LLM must not be called for empty units");
            }
        }

        let rotator = Arc::new(
            CredentialRotator::new(
                vec!["sk-test".into()],
                crate::rotation::RotationConfig::default(),
                None,
            )
            .unwrap(),
        );
        let extractor = Extractor::new(Arc::new(PanickingLlm), rotator);
        let unit = MeaningfulUnit {
            id: "u1".into(),
            episode_id: "ep1".into(),
            start_sec: 0.0,
            end_sec: 1.0,
            text: "   \n  ".into(),
            unit_type: podgraph_common::types::UnitType::Other,
            summary: String::new(),
            themes: vec![],
            primary_speaker: "Unknown".into(),
            speaker_distribution: HashMap::new(),
            completeness: Completeness::Fragmented,
            segment_indices: vec![],
            embedding: None,
            created_at: Utc::now(),
        };
        let result = extractor
            .extract(&unit, &EpisodeContext::default())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.unit_id, "u1");
    }
}
