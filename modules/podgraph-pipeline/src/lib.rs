//! The unified extraction pipeline: VTT → MeaningfulUnits → combined
//! knowledge extraction → graph persistence, with checkpoint/resume,
//! credential rotation, and post-ingest analyses.

pub mod checkpoint;
pub mod embedder;
pub mod extractor;
pub(crate) mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod postprocess;
pub mod rotation;
pub mod structurer;

pub use checkpoint::{BeginOutcome, CheckpointManager, Stage, StageRecord, StageStatus};
pub use embedder::{EmbeddingService, TextEmbedder};
pub use extractor::{CombinedExtraction, Extractor, UnitExtractor};
pub use metrics::{Anomaly, AnomalyKind, MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{
    EpisodeJob, EpisodeOutcome, EpisodeStatus, FailureKind, KnowledgeSink, Orchestrator,
    OrchestratorConfig, RunSummary,
};
pub use postprocess::{GraphPostProcessor, PostProcessor, SpeakerMapper};
pub use rotation::{CallResult, CredentialLimits, CredentialRotator, RotationConfig};
pub use structurer::{ConversationStructurer, StructureReport, Structurer, FALLBACK_SENTINEL};

/// Episode-level context threaded through the structurer and extractor
/// prompts.
#[derive(Debug, Clone, Default)]
pub struct EpisodeContext {
    pub podcast_id: String,
    pub podcast_name: String,
    pub episode_id: String,
    pub episode_title: String,
    pub published_date: String,
}
