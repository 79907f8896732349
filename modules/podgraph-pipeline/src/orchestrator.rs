//! Pipeline orchestrator: drives episodes through the stage graph
//!
//! ```text
//! parse → structure → (per unit: extract ∥ embed) → persist → cluster → analyze
//! ```
//!
//! Two pools: an episode pool bounded by `max_episodes_concurrent`, and one
//! unit-level semaphore shared across all episodes bounding extractor and
//! embedder fan-out. The orchestrator is the only place retry/skip/abort
//! decisions are made; lower layers just return typed errors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use podgraph_common::error::{FailureClass, PodGraphError};
use podgraph_common::types::{Cue, Episode, MeaningfulUnit, ProcessingStatus};
use podgraph_common::{episode_id as make_episode_id, sha256_hex};
use podgraph_graph::{GraphStore, UnitKnowledge};

use crate::checkpoint::{BeginOutcome, CheckpointManager, Stage};
use crate::embedder::TextEmbedder;
use crate::extractor::{resolve_knowledge, CombinedExtraction, UnitExtractor};
use crate::metrics::PipelineMetrics;
use crate::postprocess::PostProcessor;
use crate::structurer::{build_units, ConversationStructurer, StructureReport};
use crate::EpisodeContext;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Graph persistence as the orchestrator sees it; implemented by the
/// per-podcast `GraphStore`, mocked in tests.
#[async_trait::async_trait]
pub trait KnowledgeSink: Send + Sync {
    async fn upsert_episode(&self, episode: &Episode) -> Result<(), PodGraphError>;
    async fn set_episode_status(
        &self,
        episode_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), PodGraphError>;
    async fn persist_units(
        &self,
        units: &[(MeaningfulUnit, UnitKnowledge)],
    ) -> Result<(), PodGraphError>;
}

#[async_trait::async_trait]
impl KnowledgeSink for GraphStore {
    async fn upsert_episode(&self, episode: &Episode) -> Result<(), PodGraphError> {
        GraphStore::upsert_episode(self, episode).await
    }

    async fn set_episode_status(
        &self,
        episode_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), PodGraphError> {
        GraphStore::set_episode_status(self, episode_id, status).await
    }

    async fn persist_units(
        &self,
        units: &[(MeaningfulUnit, UnitKnowledge)],
    ) -> Result<(), PodGraphError> {
        GraphStore::persist_units(self, units).await
    }
}

// ---------------------------------------------------------------------------
// Jobs and outcomes
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EpisodeJob {
    pub vtt_path: PathBuf,
    pub podcast_id: String,
    pub podcast_name: String,
    pub sink: Arc<dyn KnowledgeSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Coarse failure category, used by the CLI to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Storage,
    Credentials,
    Validation,
    Other,
}

impl FailureKind {
    fn of(e: &PodGraphError) -> Self {
        match e {
            PodGraphError::StorageUnavailable(_) => Self::Storage,
            PodGraphError::NoCredentialAvailable(_) => Self::Credentials,
            PodGraphError::Validation(_) => Self::Validation,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodeOutcome {
    pub episode_id: String,
    pub podcast_id: String,
    pub vtt_path: PathBuf,
    pub title: String,
    pub status: EpisodeStatus,
    pub units_total: usize,
    pub units_failed: usize,
    pub units_persisted: usize,
    pub structure_fallback: bool,
    pub stages_skipped: usize,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<EpisodeOutcome>,
}

impl RunSummary {
    pub fn episodes_completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == EpisodeStatus::Completed)
            .count()
    }

    pub fn episodes_failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == EpisodeStatus::Failed)
            .count()
    }

    pub fn units_failed(&self) -> usize {
        self.outcomes.iter().map(|o| o.units_failed).sum()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Pipeline Run Complete ===")?;
        writeln!(f, "Episodes completed: {}", self.episodes_completed())?;
        writeln!(f, "Episodes failed:    {}", self.episodes_failed())?;
        writeln!(f, "Units failed:       {}", self.units_failed())?;
        for outcome in &self.outcomes {
            writeln!(
                f,
                "  [{}] {} — {:?}, {}/{} units persisted{}",
                outcome.podcast_id,
                outcome.title,
                outcome.status,
                outcome.units_persisted,
                outcome.units_total,
                outcome
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExtractArtifact {
    results: HashMap<String, CombinedExtraction>,
    failed: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbedArtifact {
    embeddings: HashMap<String, Vec<f32>>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_episodes_concurrent: usize,
    pub max_concurrent_units: usize,
    pub unit_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_episodes_concurrent: 2,
            max_concurrent_units: 4,
            unit_timeout: Duration::from_secs(1800),
        }
    }
}

pub struct Orchestrator {
    structurer: Arc<dyn ConversationStructurer>,
    extractor: Arc<dyn UnitExtractor>,
    embedder: Arc<dyn TextEmbedder>,
    post: Arc<dyn PostProcessor>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<PipelineMetrics>,
    unit_permits: Arc<Semaphore>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        structurer: Arc<dyn ConversationStructurer>,
        extractor: Arc<dyn UnitExtractor>,
        embedder: Arc<dyn TextEmbedder>,
        post: Arc<dyn PostProcessor>,
        checkpoints: Arc<CheckpointManager>,
        metrics: Arc<PipelineMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        let unit_permits = Arc::new(Semaphore::new(config.max_concurrent_units.max(1)));
        Self {
            structurer,
            extractor,
            embedder,
            post,
            checkpoints,
            metrics,
            unit_permits,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Pipeline-wide cancellation token; cancelling it cancels every
    /// episode, which cancels their pending units.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, jobs: Vec<EpisodeJob>) -> RunSummary {
        info!(episodes = jobs.len(), "pipeline run starting");
        self.metrics.set_queue_depth(jobs.len() as i64);

        let outcomes: Vec<EpisodeOutcome> = stream::iter(jobs)
            .map(|job| async {
                let outcome = self.process_episode(job).await;
                self.metrics.set_queue_depth(self.metrics.queue_depth() - 1);
                outcome
            })
            .buffer_unordered(self.config.max_episodes_concurrent.max(1))
            .collect()
            .await;

        RunSummary { outcomes }
    }

    async fn process_episode(&self, job: EpisodeJob) -> EpisodeOutcome {
        let episode_token = self.cancel.child_token();
        let path = job.vtt_path.display().to_string();
        match self.run_episode(&job, &episode_token).await {
            Ok(outcome) => {
                self.metrics.file_processed();
                outcome
            }
            Err((episode_id, e)) => {
                self.metrics.file_failed();
                let cancelled = matches!(e, PodGraphError::Cancelled(_));
                if !cancelled {
                    error!(path = path.as_str(), error = %e, "episode failed");
                }
                // Best effort: reflect the failure in the graph when the
                // episode node already exists.
                if !episode_id.is_empty() && !cancelled {
                    let _ = job
                        .sink
                        .set_episode_status(&episode_id, ProcessingStatus::Failed)
                        .await;
                }
                EpisodeOutcome {
                    episode_id,
                    podcast_id: job.podcast_id.clone(),
                    vtt_path: job.vtt_path.clone(),
                    title: path,
                    status: if cancelled {
                        EpisodeStatus::Cancelled
                    } else {
                        EpisodeStatus::Failed
                    },
                    units_total: 0,
                    units_failed: 0,
                    units_persisted: 0,
                    structure_fallback: false,
                    stages_skipped: 0,
                    failure_kind: Some(FailureKind::of(&e)),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_episode(
        &self,
        job: &EpisodeJob,
        token: &CancellationToken,
    ) -> Result<EpisodeOutcome, (String, PodGraphError)> {
        let no_id = String::new();

        // ---- parse ----
        let raw = std::fs::read_to_string(&job.vtt_path)
            .map_err(|e| (no_id.clone(), PodGraphError::Validation(format!("read VTT: {e}"))))?;
        let file_hash = sha256_hex(raw.as_bytes());
        let parsed = podgraph_vtt::parse_str(&raw)
            .map_err(|e| (no_id.clone(), PodGraphError::Validation(e.to_string())))?;
        for warning in &parsed.warnings {
            warn!(path = %job.vtt_path.display(), %warning, "VTT warning");
        }

        let title = parsed
            .metadata
            .episode_title
            .clone()
            .unwrap_or_else(|| file_stem(&job.vtt_path));
        let published_date = parsed.metadata.published_date.clone().unwrap_or_default();
        let episode_id = make_episode_id(&job.podcast_id, &title, &published_date);
        let duration = parsed.cues.last().map(|c| c.end_sec).unwrap_or(0.0);
        let ctx = EpisodeContext {
            podcast_id: job.podcast_id.clone(),
            podcast_name: job.podcast_name.clone(),
            episode_id: episode_id.clone(),
            episode_title: title.clone(),
            published_date: published_date.clone(),
        };
        let fail = |e: PodGraphError| (episode_id.clone(), e);

        let mut stages_skipped = 0usize;
        if self
            .begin_stage(&episode_id, Stage::Parse, &file_hash)
            .map_err(&fail)?
            == BeginOutcome::AlreadyDone
        {
            stages_skipped += 1;
        } else {
            self.checkpoints
                .complete(&episode_id, Stage::Parse, &file_hash)
                .map_err(&fail)?;
        }
        self.check_cancelled(token, &episode_id)?;

        // ---- structure ----
        let cues_hash = hash_cues(&parsed.cues);
        let report = self
            .structure_stage(&episode_id, &parsed.cues, &ctx, &cues_hash, &mut stages_skipped)
            .await
            .map_err(&fail)?;
        self.check_cancelled(token, &episode_id)?;

        let units = build_units(&episode_id, &parsed.cues, &report);
        self.metrics.units_created(units.len() as u64);
        let units_hash = hash_units(&units);

        // ---- extract ∥ embed ----
        let (extractions, embeddings, failed_units) = self
            .unit_stages(&episode_id, &units, &ctx, &units_hash, token, &mut stages_skipped)
            .await
            .map_err(&fail)?;
        self.check_cancelled(token, &episode_id)?;

        // ---- persist ----
        let episode = Episode {
            id: episode_id.clone(),
            podcast_id: job.podcast_id.clone(),
            title: title.clone(),
            published_date,
            youtube_url: parsed.metadata.youtube_url.clone(),
            vtt_path: job.vtt_path.display().to_string(),
            duration_seconds: duration,
            processing_status: ProcessingStatus::Embedded,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let mut persistable: Vec<(MeaningfulUnit, UnitKnowledge)> = Vec::new();
        for unit in &units {
            let Some(extraction) = extractions.get(&unit.id) else {
                continue;
            };
            let mut unit = unit.clone();
            unit.embedding = embeddings.get(&unit.id).cloned();
            let knowledge = resolve_knowledge(extraction, &unit.id);
            persistable.push((unit, knowledge));
        }

        if self
            .begin_stage(&episode_id, Stage::Persist, &units_hash)
            .map_err(&fail)?
            == BeginOutcome::AlreadyDone
        {
            stages_skipped += 1;
        } else {
            let started = std::time::Instant::now();
            let persisted = async {
                job.sink.upsert_episode(&episode).await?;
                job.sink.persist_units(&persistable).await?;
                job.sink
                    .set_episode_status(&episode_id, ProcessingStatus::Embedded)
                    .await
            }
            .await;
            self.metrics
                .observe_db_write_ms(started.elapsed().as_secs_f64() * 1000.0);
            match persisted {
                Ok(()) => self
                    .checkpoints
                    .complete(&episode_id, Stage::Persist, &units_hash)
                    .map_err(&fail)?,
                Err(e) => {
                    let _ = self.checkpoints.fail(&episode_id, Stage::Persist, &e.to_string());
                    return Err(fail(e));
                }
            }
        }
        self.check_cancelled(token, &episode_id)?;

        // ---- cluster ----
        if self
            .post_stage(job, &episode_id, Stage::Cluster, &units_hash, &mut stages_skipped)
            .await
            .map_err(&fail)?
        {
            let _ = job
                .sink
                .set_episode_status(&episode_id, ProcessingStatus::Clustered)
                .await;
        }
        self.check_cancelled(token, &episode_id)?;

        // ---- analyze ----
        if self
            .post_stage(job, &episode_id, Stage::Analyze, &units_hash, &mut stages_skipped)
            .await
            .map_err(&fail)?
        {
            let _ = job
                .sink
                .set_episode_status(&episode_id, ProcessingStatus::Complete)
                .await;
        }

        info!(
            episode_id = episode_id.as_str(),
            units = units.len(),
            failed = failed_units,
            skipped_stages = stages_skipped,
            "episode complete"
        );
        Ok(EpisodeOutcome {
            episode_id,
            podcast_id: job.podcast_id.clone(),
            vtt_path: job.vtt_path.clone(),
            title,
            status: EpisodeStatus::Completed,
            units_total: units.len(),
            units_failed: failed_units,
            units_persisted: persistable.len(),
            structure_fallback: report.fallback_used,
            stages_skipped,
            failure_kind: None,
            error: None,
        })
    }

    async fn structure_stage(
        &self,
        episode_id: &str,
        cues: &[Cue],
        ctx: &EpisodeContext,
        cues_hash: &str,
        stages_skipped: &mut usize,
    ) -> Result<StructureReport, PodGraphError> {
        if self.begin_stage(episode_id, Stage::Structure, cues_hash)? == BeginOutcome::AlreadyDone {
            if let Some(report) = self
                .checkpoints
                .load_artifact::<StructureReport>(episode_id, Stage::Structure)?
            {
                *stages_skipped += 1;
                return Ok(report);
            }
            // Completed record without its artifact: run the stage again.
        }
        let report = self.structurer.structure(cues, ctx).await;
        self.checkpoints
            .save_artifact(episode_id, Stage::Structure, &report)?;
        self.checkpoints
            .complete(episode_id, Stage::Structure, cues_hash)?;
        Ok(report)
    }

    /// Fan units out over the shared unit pool, running extraction and
    /// embedding concurrently per unit. Returns extraction results,
    /// embeddings, and the failed-unit count.
    #[allow(clippy::type_complexity)]
    async fn unit_stages(
        &self,
        episode_id: &str,
        units: &[MeaningfulUnit],
        ctx: &EpisodeContext,
        units_hash: &str,
        token: &CancellationToken,
        stages_skipped: &mut usize,
    ) -> Result<(HashMap<String, CombinedExtraction>, HashMap<String, Vec<f32>>, usize), PodGraphError>
    {
        let mut extract_artifact: Option<ExtractArtifact> = None;
        let mut embed_artifact: Option<EmbedArtifact> = None;

        if self.begin_stage(episode_id, Stage::Extract, units_hash)? == BeginOutcome::AlreadyDone {
            extract_artifact = self
                .checkpoints
                .load_artifact(episode_id, Stage::Extract)?;
            if extract_artifact.is_some() {
                *stages_skipped += 1;
            }
        }
        if self.begin_stage(episode_id, Stage::Embed, units_hash)? == BeginOutcome::AlreadyDone {
            embed_artifact = self.checkpoints.load_artifact(episode_id, Stage::Embed)?;
            if embed_artifact.is_some() {
                *stages_skipped += 1;
            }
        }

        let run_extract = extract_artifact.is_none();
        let run_embed = embed_artifact.is_none();
        let mut extract_artifact = extract_artifact.unwrap_or_default();
        let mut embed_artifact = embed_artifact.unwrap_or_default();

        if run_extract || run_embed {
            let outcomes: Vec<UnitOutcome> = stream::iter(units.iter())
                .map(|unit| self.process_unit(unit, ctx, token, run_extract, run_embed))
                .buffer_unordered(self.config.max_concurrent_units.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    UnitOutcome::Done {
                        unit_id,
                        extraction,
                        embedding,
                    } => {
                        if let Some(extraction) = extraction {
                            extract_artifact.results.insert(unit_id.clone(), extraction);
                        }
                        if let Some(embedding) = embedding {
                            embed_artifact.embeddings.insert(unit_id, embedding);
                        }
                    }
                    UnitOutcome::Failed { unit_id, error } => {
                        warn!(unit_id = unit_id.as_str(), error = %error, "unit skipped");
                        extract_artifact.failed.push(unit_id);
                    }
                    UnitOutcome::Fatal(e) => return Err(e),
                    UnitOutcome::Cancelled => {
                        return Err(PodGraphError::Cancelled("episode cancelled".to_string()))
                    }
                }
            }

            if run_extract {
                self.checkpoints
                    .save_artifact(episode_id, Stage::Extract, &extract_artifact)?;
                self.checkpoints
                    .complete(episode_id, Stage::Extract, units_hash)?;
            }
            if run_embed {
                self.checkpoints
                    .save_artifact(episode_id, Stage::Embed, &embed_artifact)?;
                self.checkpoints
                    .complete(episode_id, Stage::Embed, units_hash)?;
            }
        }

        let failed = extract_artifact.failed.len();
        Ok((extract_artifact.results, embed_artifact.embeddings, failed))
    }

    async fn process_unit(
        &self,
        unit: &MeaningfulUnit,
        ctx: &EpisodeContext,
        token: &CancellationToken,
        run_extract: bool,
        run_embed: bool,
    ) -> UnitOutcome {
        let _permit = match self.unit_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return UnitOutcome::Cancelled,
        };
        let started = std::time::Instant::now();

        let work = async {
            let extract_fut = async {
                if run_extract {
                    Some(self.extractor.extract(unit, ctx).await)
                } else {
                    None
                }
            };
            let embed_fut = async {
                if run_embed {
                    Some(self.embedder.embed(std::slice::from_ref(&unit.text)).await)
                } else {
                    None
                }
            };
            tokio::join!(extract_fut, embed_fut)
        };

        let result = tokio::select! {
            _ = token.cancelled() => {
                // In-flight provider calls are external; results are
                // discarded, not interrupted.
                return UnitOutcome::Cancelled;
            }
            result = tokio::time::timeout(self.config.unit_timeout, work) => result,
        };

        self.metrics
            .observe_unit_duration_s(started.elapsed().as_secs_f64());

        let (extract_result, embed_result) = match result {
            Err(_) => {
                self.metrics.api_call(false);
                return UnitOutcome::Failed {
                    unit_id: unit.id.clone(),
                    error: PodGraphError::Cancelled(format!(
                        "unit timed out after {:?}",
                        self.config.unit_timeout
                    )),
                };
            }
            Ok(pair) => pair,
        };

        let extraction = match extract_result {
            None => None,
            Some(Ok(extraction)) => {
                self.metrics.api_call(true);
                Some(extraction)
            }
            Some(Err(e)) => {
                self.metrics.api_call(false);
                return match e.class() {
                    FailureClass::Fatal => UnitOutcome::Fatal(e),
                    _ => UnitOutcome::Failed {
                        unit_id: unit.id.clone(),
                        error: e,
                    },
                };
            }
        };

        let embedding = match embed_result {
            None => None,
            Some(Ok(mut vectors)) => {
                self.metrics.api_call(true);
                vectors.pop()
            }
            Some(Err(e)) => {
                self.metrics.api_call(false);
                return match e.class() {
                    FailureClass::Fatal => UnitOutcome::Fatal(e),
                    _ => UnitOutcome::Failed {
                        unit_id: unit.id.clone(),
                        error: e,
                    },
                };
            }
        };

        UnitOutcome::Done {
            unit_id: unit.id.clone(),
            extraction,
            embedding,
        }
    }

    /// Returns whether the stage actually ran (false when skipped via its
    /// checkpoint).
    async fn post_stage(
        &self,
        job: &EpisodeJob,
        episode_id: &str,
        stage: Stage,
        payload_hash: &str,
        stages_skipped: &mut usize,
    ) -> Result<bool, PodGraphError> {
        if self.begin_stage(episode_id, stage, payload_hash)? == BeginOutcome::AlreadyDone {
            *stages_skipped += 1;
            return Ok(false);
        }
        let result = match stage {
            Stage::Cluster => {
                self.post
                    .run_cluster_stage(&job.podcast_id, episode_id)
                    .await
            }
            Stage::Analyze => {
                self.post
                    .run_analyze_stage(&job.podcast_id, episode_id)
                    .await
            }
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                self.checkpoints.complete(episode_id, stage, payload_hash)?;
                Ok(true)
            }
            Err(e) => {
                let _ = self.checkpoints.fail(episode_id, stage, &e.to_string());
                match e.class() {
                    // Post-processing is enrichment; only infrastructure
                    // failures abort the episode.
                    FailureClass::Fatal => Err(e),
                    _ => {
                        warn!(episode_id, stage = %stage, error = %e, "post stage skipped");
                        Ok(false)
                    }
                }
            }
        }
    }

    fn begin_stage(
        &self,
        episode_id: &str,
        stage: Stage,
        payload_hash: &str,
    ) -> Result<BeginOutcome, PodGraphError> {
        self.checkpoints.begin(episode_id, stage, payload_hash)
    }

    fn check_cancelled(
        &self,
        token: &CancellationToken,
        episode_id: &str,
    ) -> Result<(), (String, PodGraphError)> {
        if token.is_cancelled() {
            Err((
                episode_id.to_string(),
                PodGraphError::Cancelled("episode cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }
}

enum UnitOutcome {
    Done {
        unit_id: String,
        extraction: Option<CombinedExtraction>,
        embedding: Option<Vec<f32>>,
    },
    Failed {
        unit_id: String,
        error: PodGraphError,
    },
    Fatal(PodGraphError),
    Cancelled,
}

fn file_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}

fn hash_cues(cues: &[Cue]) -> String {
    let serialized = serde_json::to_string(cues).unwrap_or_default();
    sha256_hex(serialized.as_bytes())
}

fn hash_units(units: &[MeaningfulUnit]) -> String {
    // Ids alone are not enough: they hash timing, not content, and a
    // re-transcribed VTT can change text under identical cue times.
    let mut parts = Vec::with_capacity(units.len() * 2);
    for unit in units {
        parts.push(unit.id.as_str());
        parts.push(unit.text.as_str());
    }
    sha256_hex(parts.join("\n").as_bytes())
}
