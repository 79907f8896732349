use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// --- Cues ---

/// A single timed caption block. Transient: lives only in memory while an
/// episode is being processed, never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    pub speaker: Option<String>,
}

impl Cue {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_sec - self.start_sec).max(0.0)
    }
}

/// Episode-level metadata recovered from the leading NOTE block of a VTT
/// file. All fields optional; the router and episode builder fill gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub podcast_id: Option<String>,
    pub episode_title: Option<String>,
    pub youtube_url: Option<String>,
    pub published_date: Option<String>,
}

impl EpisodeMetadata {
    pub fn is_empty(&self) -> bool {
        self.podcast_id.is_none()
            && self.episode_title.is_none()
            && self.youtube_url.is_none()
            && self.published_date.is_none()
    }
}

// --- Episode ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Parsed,
    Structured,
    Extracted,
    Embedded,
    Clustered,
    Complete,
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Parsed => "parsed",
            ProcessingStatus::Structured => "structured",
            ProcessingStatus::Extracted => "extracted",
            ProcessingStatus::Embedded => "embedded",
            ProcessingStatus::Clustered => "clustered",
            ProcessingStatus::Complete => "complete",
            ProcessingStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "parsed" => Ok(Self::Parsed),
            "structured" => Ok(Self::Structured),
            "extracted" => Ok(Self::Extracted),
            "embedded" => Ok(Self::Embedded),
            "clustered" => Ok(Self::Clustered),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown ProcessingStatus: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub podcast_id: String,
    pub title: String,
    pub published_date: String,
    pub youtube_url: Option<String>,
    pub vtt_path: String,
    pub duration_seconds: f64,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- MeaningfulUnit ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Introduction,
    TopicDiscussion,
    Story,
    QaExchange,
    Tangent,
    Conclusion,
    Other,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Introduction => "introduction",
            UnitType::TopicDiscussion => "topic_discussion",
            UnitType::Story => "story",
            UnitType::QaExchange => "qa_exchange",
            UnitType::Tangent => "tangent",
            UnitType::Conclusion => "conclusion",
            UnitType::Other => "other",
        }
    }

    /// Fold a free-form LLM label onto the closed vocabulary. Unknown
    /// labels land on `Other` rather than failing the unit.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "introduction" | "intro" => Self::Introduction,
            "topic_discussion" | "topic" | "discussion" => Self::TopicDiscussion,
            "story" | "anecdote" => Self::Story,
            "qa_exchange" | "q&a" | "qa" | "question_answer" => Self::QaExchange,
            "tangent" => Self::Tangent,
            "conclusion" | "outro" | "closing" => Self::Conclusion,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Incomplete,
    Fragmented,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Complete => "complete",
            Completeness::Incomplete => "incomplete",
            Completeness::Fragmented => "fragmented",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "complete" => Self::Complete,
            "incomplete" => Self::Incomplete,
            _ => Self::Fragmented,
        }
    }
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A coherent conversational span assembled from consecutive cues: a full
/// Q&A exchange, a story, a topic segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeaningfulUnit {
    pub id: String,
    pub episode_id: String,
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    pub unit_type: UnitType,
    pub summary: String,
    pub themes: Vec<String>,
    pub primary_speaker: String,
    /// speaker → percent of unit airtime. Values sum to 100 exactly; the
    /// largest share absorbs the rounding remainder.
    pub speaker_distribution: HashMap<String, f64>,
    pub completeness: Completeness,
    pub segment_indices: Vec<usize>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl MeaningfulUnit {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_sec - self.start_sec).max(0.0)
    }
}

/// Index-range description of a unit before cue text is materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub start_index: usize,
    pub end_index: usize,
    pub unit_type: UnitType,
    pub summary: String,
    pub themes: Vec<String>,
    pub completeness: Completeness,
}

// --- Entities ---

/// Canonical entity type vocabulary. The extractor emits free-form labels;
/// `EntityType::fold` maps them here before anything touches the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum EntityType {
    Person,
    Company,
    Institution,
    Concept,
    Framework,
    Method,
    Theory,
    Technology,
    Product,
    Tool,
    Platform,
    Book,
    Study,
    Research,
    Article,
    Medication,
    Condition,
    Treatment,
    BiologicalProcess,
    Chemical,
    Location,
    Event,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "Person",
            EntityType::Company => "Company",
            EntityType::Institution => "Institution",
            EntityType::Concept => "Concept",
            EntityType::Framework => "Framework",
            EntityType::Method => "Method",
            EntityType::Theory => "Theory",
            EntityType::Technology => "Technology",
            EntityType::Product => "Product",
            EntityType::Tool => "Tool",
            EntityType::Platform => "Platform",
            EntityType::Book => "Book",
            EntityType::Study => "Study",
            EntityType::Research => "Research",
            EntityType::Article => "Article",
            EntityType::Medication => "Medication",
            EntityType::Condition => "Condition",
            EntityType::Treatment => "Treatment",
            EntityType::BiologicalProcess => "Biological_Process",
            EntityType::Chemical => "Chemical",
            EntityType::Location => "Location",
            EntityType::Event => "Event",
            EntityType::Other => "Other",
        }
    }

    /// Map a free-form label from the LLM onto the canonical vocabulary.
    pub fn fold(label: &str) -> Self {
        let key: String = label
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        match key.as_str() {
            "person" | "people" | "human" | "individual" => Self::Person,
            "company" | "organization" | "organisation" | "corporation" | "startup"
            | "business" => Self::Company,
            "institution" | "university" | "government" | "agency" | "nonprofit" => {
                Self::Institution
            }
            "concept" | "idea" | "topic" => Self::Concept,
            "framework" | "model" => Self::Framework,
            "method" | "methodology" | "technique" | "practice" | "protocol" => Self::Method,
            "theory" | "hypothesis" => Self::Theory,
            "technology" | "tech" => Self::Technology,
            "product" | "service" => Self::Product,
            "tool" | "software" | "app" | "application" => Self::Tool,
            "platform" => Self::Platform,
            "book" | "novel" => Self::Book,
            "study" | "trial" | "experiment" => Self::Study,
            "research" | "paper" => Self::Research,
            "article" | "essay" | "post" => Self::Article,
            "medication" | "drug" | "supplement" => Self::Medication,
            "condition" | "disease" | "disorder" | "illness" | "syndrome" => Self::Condition,
            "treatment" | "therapy" | "intervention" => Self::Treatment,
            "biologicalprocess" | "process" => Self::BiologicalProcess,
            "chemical" | "compound" | "molecule" | "hormone" => Self::Chemical,
            "location" | "place" | "city" | "country" | "region" => Self::Location,
            "event" | "conference" => Self::Event,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An entity merged across units by `(canonicalName, type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub description: String,
    /// 1-10.
    pub importance: u8,
    pub first_seen_unit_id: String,
    pub aliases: Vec<String>,
}

/// Properties on the `MENTIONED_IN` edge from an entity to a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub context: String,
    pub frequency: u32,
    pub importance: u8,
}

// --- Quotes ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub text: String,
    pub speaker: String,
    pub context: String,
    pub is_memorable: bool,
    pub theme: Option<String>,
}

// --- Insights ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Actionable,
    Conceptual,
    Experiential,
    Predictive,
    Analytical,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Actionable => "actionable",
            InsightType::Conceptual => "conceptual",
            InsightType::Experiential => "experiential",
            InsightType::Predictive => "predictive",
            InsightType::Analytical => "analytical",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "actionable" | "practical" => Self::Actionable,
            "experiential" | "experience" | "story" => Self::Experiential,
            "predictive" | "prediction" | "forecast" => Self::Predictive,
            "analytical" | "analysis" | "comparison" => Self::Analytical,
            _ => Self::Conceptual,
        }
    }
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub title: String,
    pub description: String,
    pub insight_type: InsightType,
    /// 1-10.
    pub confidence: u8,
    /// Canonical names of entities supporting this insight, resolved to
    /// `SUPPORTED_BY` edges at persist time.
    pub supporting_entities: Vec<String>,
}

// --- Relationships ---

/// Edge between two entities, kept as name tuples until the store resolves
/// ids. `relationship_type` is an open vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub source_entity: String,
    pub target_entity: String,
    pub relationship_type: String,
    pub description: String,
    /// 1-10.
    pub confidence: u8,
    pub evidence: Option<String>,
    pub source_unit_id: String,
}

// --- Clusters ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub label: String,
    pub member_count: u64,
    pub centroid: Vec<f32>,
}
