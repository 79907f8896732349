//! End-to-end pipeline scenarios against mock providers and a mock graph
//! sink. No network, no database: everything flows through the trait seams
//! the orchestrator exposes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use podgraph_common::error::PodGraphError;
use podgraph_common::types::{
    Completeness, Cue, Episode, MeaningfulUnit, ProcessingStatus, UnitSpec, UnitType,
};
use podgraph_graph::UnitKnowledge;
use podgraph_pipeline::extractor::{
    CombinedExtraction, ExtractedEntity, ExtractedQuote, UnitExtractor,
};
use podgraph_pipeline::structurer::{ConversationStructurer, StructureReport};
use podgraph_pipeline::{
    CheckpointManager, EpisodeContext, EpisodeJob, EpisodeStatus, KnowledgeSink, Orchestrator,
    OrchestratorConfig, PipelineMetrics, PostProcessor, TextEmbedder,
};

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

/// Splits the cue range into `parts` contiguous units.
struct SplittingStructurer {
    parts: usize,
}

#[async_trait]
impl ConversationStructurer for SplittingStructurer {
    async fn structure(&self, cues: &[Cue], _ctx: &EpisodeContext) -> StructureReport {
        let n = cues.len();
        let parts = self.parts.clamp(1, n.max(1));
        let chunk = n.div_ceil(parts);
        let mut specs = Vec::new();
        let mut start = 0;
        while start < n {
            let end = (start + chunk - 1).min(n - 1);
            specs.push(UnitSpec {
                start_index: start,
                end_index: end,
                unit_type: UnitType::TopicDiscussion,
                summary: format!("cues {start}-{end}"),
                themes: Vec::new(),
                completeness: Completeness::Complete,
            });
            start = end + 1;
        }
        StructureReport {
            specs,
            fallback_used: false,
            gaps: Vec::new(),
            themes: Vec::new(),
        }
    }
}

/// Scripted extractor: fails any unit whose text contains a marker, counts
/// calls, and otherwise returns a small fixed result.
struct ScriptedExtractor {
    calls: AtomicUsize,
    fail_marker: Option<&'static str>,
    fatal: bool,
}

impl ScriptedExtractor {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: None,
            fatal: false,
        }
    }

    fn failing_on(marker: &'static str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: Some(marker),
            fatal: false,
        }
    }

    fn fatal() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_marker: None,
            fatal: true,
        }
    }
}

#[async_trait]
impl UnitExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        unit: &MeaningfulUnit,
        _ctx: &EpisodeContext,
    ) -> Result<CombinedExtraction, PodGraphError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(PodGraphError::NoCredentialAvailable(Duration::from_secs(120)));
        }
        if let Some(marker) = self.fail_marker {
            if unit.text.contains(marker) {
                return Err(PodGraphError::Extraction(
                    "invalid JSON after repair".to_string(),
                ));
            }
        }
        let mut extraction = CombinedExtraction::empty(&unit.id);
        extraction.entities.push(ExtractedEntity {
            name: "Test Entity".to_string(),
            entity_type: podgraph_common::types::EntityType::Concept,
            description: "an entity".to_string(),
            importance: 5,
            frequency: 1,
            has_citation: false,
            context_snippet: None,
        });
        extraction.quotes.push(ExtractedQuote {
            text: "A quote long enough to survive the filter.".to_string(),
            speaker: unit.primary_speaker.clone(),
            context: String::new(),
            is_memorable: true,
            theme: None,
        });
        Ok(extraction)
    }
}

struct FixedEmbedder {
    calls: AtomicUsize,
}

impl FixedEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    fn dimension(&self) -> usize {
        4
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PodGraphError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| vec![0.5, 0.5, 0.5, 0.5]).collect())
    }
}

#[derive(Default)]
struct RecordingSink {
    episodes: Mutex<Vec<Episode>>,
    persisted: Mutex<Vec<(MeaningfulUnit, UnitKnowledge)>>,
    statuses: Mutex<Vec<(String, ProcessingStatus)>>,
    write_calls: AtomicUsize,
}

#[async_trait]
impl KnowledgeSink for RecordingSink {
    async fn upsert_episode(&self, episode: &Episode) -> Result<(), PodGraphError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.episodes.lock().unwrap().push(episode.clone());
        Ok(())
    }

    async fn set_episode_status(
        &self,
        episode_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), PodGraphError> {
        self.statuses
            .lock()
            .unwrap()
            .push((episode_id.to_string(), status));
        Ok(())
    }

    async fn persist_units(
        &self,
        units: &[(MeaningfulUnit, UnitKnowledge)],
    ) -> Result<(), PodGraphError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.persisted.lock().unwrap().extend_from_slice(units);
        Ok(())
    }
}

#[derive(Default)]
struct NoopPost {
    cluster_calls: AtomicUsize,
    analyze_calls: AtomicUsize,
}

#[async_trait]
impl PostProcessor for NoopPost {
    async fn run_cluster_stage(
        &self,
        _podcast_id: &str,
        _episode_id: &str,
    ) -> Result<(), PodGraphError> {
        self.cluster_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_analyze_stage(
        &self,
        _podcast_id: &str,
        _episode_id: &str,
    ) -> Result<(), PodGraphError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _checkpoint_dir: tempfile::TempDir,
    _vtt_dir: tempfile::TempDir,
    orchestrator: Orchestrator,
    extractor: Arc<ScriptedExtractor>,
    embedder: Arc<FixedEmbedder>,
    sink: Arc<RecordingSink>,
    post: Arc<NoopPost>,
    vtt_path: PathBuf,
}

fn write_vtt(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn harness_with(
    structurer_parts: usize,
    extractor: ScriptedExtractor,
    vtt_body: &str,
) -> Harness {
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let vtt_dir = tempfile::tempdir().unwrap();
    let vtt_path = write_vtt(&vtt_dir, "episode.vtt", vtt_body);

    let extractor = Arc::new(extractor);
    let embedder = Arc::new(FixedEmbedder::new());
    let sink = Arc::new(RecordingSink::default());
    let post = Arc::new(NoopPost::default());

    let orchestrator = Orchestrator::new(
        Arc::new(SplittingStructurer {
            parts: structurer_parts,
        }),
        extractor.clone(),
        embedder.clone(),
        post.clone(),
        Arc::new(CheckpointManager::new(checkpoint_dir.path())),
        Arc::new(PipelineMetrics::default()),
        OrchestratorConfig {
            max_episodes_concurrent: 2,
            max_concurrent_units: 4,
            unit_timeout: Duration::from_secs(30),
        },
    );

    Harness {
        _checkpoint_dir: checkpoint_dir,
        _vtt_dir: vtt_dir,
        orchestrator,
        extractor,
        embedder,
        sink,
        post,
        vtt_path,
    }
}

fn job(harness: &Harness) -> EpisodeJob {
    EpisodeJob {
        vtt_path: harness.vtt_path.clone(),
        podcast_id: "test_podcast".to_string(),
        podcast_name: "Test Podcast".to_string(),
        sink: harness.sink.clone(),
    }
}

const MINIMAL_VTT: &str =
    "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHello.\n\n00:00:02.000 --> 00:00:04.000\nGoodbye.\n";

const TWO_SPEAKER_VTT: &str = "WEBVTT\n\n\
00:00:00.000 --> 00:00:10.000\n<v Host>Welcome to the show.\n\n\
00:00:10.000 --> 00:00:15.000\n<v Guest>Thanks for having me.\n\n\
00:00:15.000 --> 00:00:25.000\n<v Host>Let's start with your story.\n\n\
00:00:25.000 --> 00:00:30.000\n<v Guest>It begins in a garage.\n\n\
00:00:30.000 --> 00:00:40.000\n<v Host>Classic. What happened next?\n\n\
00:00:40.000 --> 00:00:45.000\n<v Guest>We shipped it.\n";

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn minimal_episode_flows_end_to_end() {
    let h = harness_with(1, ScriptedExtractor::ok(), MINIMAL_VTT);
    let summary = h.orchestrator.run(vec![job(&h)]).await;

    assert_eq!(summary.outcomes.len(), 1);
    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.status, EpisodeStatus::Completed);
    assert_eq!(outcome.units_total, 1);
    assert_eq!(outcome.units_persisted, 1);
    assert_eq!(outcome.units_failed, 0);

    // One extractor call with the joined text; one episode node; one unit.
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.episodes.lock().unwrap().len(), 1);
    let persisted = h.sink.persisted.lock().unwrap();
    assert_eq!(persisted.len(), 1);
    let (unit, knowledge) = &persisted[0];
    assert!(unit.text.contains("Hello."));
    assert!(unit.text.contains("Goodbye."));
    assert_eq!(unit.segment_indices, vec![0, 1]);
    assert!(unit.embedding.is_some());
    assert_eq!(knowledge.entities.len(), 1);

    // Post-processing ran once per episode.
    assert_eq!(h.post.cluster_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.post.analyze_calls.load(Ordering::SeqCst), 1);

    // Episode progressed to complete.
    let statuses = h.sink.statuses.lock().unwrap();
    assert_eq!(
        statuses.last().map(|(_, s)| *s),
        Some(ProcessingStatus::Complete)
    );
}

#[tokio::test]
async fn two_speaker_unit_carries_speaker_distribution() {
    let h = harness_with(1, ScriptedExtractor::ok(), TWO_SPEAKER_VTT);
    let summary = h.orchestrator.run(vec![job(&h)]).await;
    assert_eq!(summary.outcomes[0].status, EpisodeStatus::Completed);

    let persisted = h.sink.persisted.lock().unwrap();
    let (unit, _) = &persisted[0];
    assert_eq!(unit.segment_indices.len(), 6);
    // Host speaks 30s of 45s; Guest 15s.
    assert_eq!(unit.primary_speaker, "Host");
    let sum: f64 = unit.speaker_distribution.values().sum();
    assert!((sum - 100.0).abs() < 0.5, "sum {sum}");
    assert!(unit.speaker_distribution["Host"] > unit.speaker_distribution["Guest"]);
}

#[tokio::test]
async fn failed_unit_is_skipped_and_episode_continues() {
    // Two units; the second one's text contains the failure marker.
    let vtt = "WEBVTT\n\n\
00:00:00.000 --> 00:00:02.000\nfine content\n\n\
00:00:02.000 --> 00:00:04.000\nFAILME content\n";
    let h = harness_with(2, ScriptedExtractor::failing_on("FAILME"), vtt);
    let summary = h.orchestrator.run(vec![job(&h)]).await;

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.status, EpisodeStatus::Completed);
    assert_eq!(outcome.units_total, 2);
    assert_eq!(outcome.units_failed, 1);
    assert_eq!(outcome.units_persisted, 1);

    let persisted = h.sink.persisted.lock().unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].0.text.contains("fine content"));
}

#[tokio::test]
async fn fatal_error_aborts_episode_without_writes() {
    let h = harness_with(1, ScriptedExtractor::fatal(), MINIMAL_VTT);
    let summary = h.orchestrator.run(vec![job(&h)]).await;

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.status, EpisodeStatus::Failed);
    assert_eq!(
        outcome.failure_kind,
        Some(podgraph_pipeline::FailureKind::Credentials)
    );
    assert!(h.sink.persisted.lock().unwrap().is_empty());
    assert!(h.sink.episodes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rerun_skips_llm_and_graph_writes() {
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let vtt_dir = tempfile::tempdir().unwrap();
    let vtt_path = write_vtt(&vtt_dir, "episode.vtt", MINIMAL_VTT);

    let run = |sink: Arc<RecordingSink>,
               extractor: Arc<ScriptedExtractor>,
               embedder: Arc<FixedEmbedder>| {
        let orchestrator = Orchestrator::new(
            Arc::new(SplittingStructurer { parts: 1 }),
            extractor,
            embedder,
            Arc::new(NoopPost::default()),
            Arc::new(CheckpointManager::new(checkpoint_dir.path())),
            Arc::new(PipelineMetrics::default()),
            OrchestratorConfig::default(),
        );
        let job = EpisodeJob {
            vtt_path: vtt_path.clone(),
            podcast_id: "test_podcast".to_string(),
            podcast_name: "Test Podcast".to_string(),
            sink,
        };
        async move { orchestrator.run(vec![job]).await }
    };

    // First run does the work.
    let sink1 = Arc::new(RecordingSink::default());
    let extractor1 = Arc::new(ScriptedExtractor::ok());
    let embedder1 = Arc::new(FixedEmbedder::new());
    let summary = run(sink1.clone(), extractor1.clone(), embedder1.clone()).await;
    assert_eq!(summary.outcomes[0].status, EpisodeStatus::Completed);
    assert_eq!(extractor1.calls.load(Ordering::SeqCst), 1);
    assert!(sink1.write_calls.load(Ordering::SeqCst) > 0);

    // Second run on unchanged input: zero LLM calls, zero graph writes.
    let sink2 = Arc::new(RecordingSink::default());
    let extractor2 = Arc::new(ScriptedExtractor::ok());
    let embedder2 = Arc::new(FixedEmbedder::new());
    let summary = run(sink2.clone(), extractor2.clone(), embedder2.clone()).await;
    assert_eq!(summary.outcomes[0].status, EpisodeStatus::Completed);
    assert_eq!(extractor2.calls.load(Ordering::SeqCst), 0);
    assert_eq!(embedder2.calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink2.write_calls.load(Ordering::SeqCst), 0);
    assert!(summary.outcomes[0].stages_skipped >= 5);
}

#[tokio::test]
async fn changed_vtt_invalidates_checkpoints() {
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let vtt_dir = tempfile::tempdir().unwrap();
    let vtt_path = write_vtt(&vtt_dir, "episode.vtt", MINIMAL_VTT);

    let make = |extractor: Arc<ScriptedExtractor>, sink: Arc<RecordingSink>| {
        Orchestrator::new(
            Arc::new(SplittingStructurer { parts: 1 }),
            extractor,
            Arc::new(FixedEmbedder::new()),
            Arc::new(NoopPost::default()),
            Arc::new(CheckpointManager::new(checkpoint_dir.path())),
            Arc::new(PipelineMetrics::default()),
            OrchestratorConfig::default(),
        )
    };
    let job = |sink: &Arc<RecordingSink>| EpisodeJob {
        vtt_path: vtt_path.clone(),
        podcast_id: "test_podcast".to_string(),
        podcast_name: "Test Podcast".to_string(),
        sink: sink.clone(),
    };

    let extractor1 = Arc::new(ScriptedExtractor::ok());
    let sink1 = Arc::new(RecordingSink::default());
    make(extractor1.clone(), sink1.clone())
        .run(vec![job(&sink1)])
        .await;
    assert_eq!(extractor1.calls.load(Ordering::SeqCst), 1);

    // Same title and timing, different cue text: the structure and unit
    // hashes change, so the stages re-run.
    std::fs::write(
        &vtt_path,
        "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHello again.\n\n00:00:02.000 --> 00:00:04.000\nGoodbye.\n",
    )
    .unwrap();
    let extractor2 = Arc::new(ScriptedExtractor::ok());
    let sink2 = Arc::new(RecordingSink::default());
    make(extractor2.clone(), sink2.clone())
        .run(vec![job(&sink2)])
        .await;
    assert_eq!(extractor2.calls.load(Ordering::SeqCst), 1);
    assert!(sink2.write_calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn cancelled_pipeline_writes_nothing_further() {
    let h = harness_with(1, ScriptedExtractor::ok(), MINIMAL_VTT);
    h.orchestrator.cancellation_token().cancel();
    let summary = h.orchestrator.run(vec![job(&h)]).await;

    assert_eq!(summary.outcomes[0].status, EpisodeStatus::Cancelled);
    assert!(h.sink.persisted.lock().unwrap().is_empty());
    assert!(h.sink.episodes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn multiple_episodes_process_independently() {
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let vtt_dir = tempfile::tempdir().unwrap();
    let good = write_vtt(&vtt_dir, "good.vtt", MINIMAL_VTT);
    let bad = write_vtt(&vtt_dir, "bad.vtt", "not a vtt file\n");

    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Orchestrator::new(
        Arc::new(SplittingStructurer { parts: 1 }),
        Arc::new(ScriptedExtractor::ok()),
        Arc::new(FixedEmbedder::new()),
        Arc::new(NoopPost::default()),
        Arc::new(CheckpointManager::new(checkpoint_dir.path())),
        Arc::new(PipelineMetrics::default()),
        OrchestratorConfig::default(),
    );

    let jobs = vec![
        EpisodeJob {
            vtt_path: good,
            podcast_id: "test_podcast".to_string(),
            podcast_name: "Test Podcast".to_string(),
            sink: sink.clone(),
        },
        EpisodeJob {
            vtt_path: bad,
            podcast_id: "test_podcast".to_string(),
            podcast_name: "Test Podcast".to_string(),
            sink: sink.clone(),
        },
    ];
    let summary = orchestrator.run(jobs).await;

    assert_eq!(summary.episodes_completed(), 1);
    assert_eq!(summary.episodes_failed(), 1);
    let failed = summary
        .outcomes
        .iter()
        .find(|o| o.status == EpisodeStatus::Failed)
        .unwrap();
    assert_eq!(
        failed.failure_kind,
        Some(podgraph_pipeline::FailureKind::Validation)
    );
    // The good episode still persisted.
    assert_eq!(sink.persisted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_unit_text_round_trips_as_empty_extraction() {
    // A VTT whose cue text is whitespace only never reaches the parser's
    // output (empty cues are dropped), so drive the extractor directly.
    use podgraph_pipeline::extractor::resolve_knowledge;
    let extraction = CombinedExtraction::empty("u-empty");
    let knowledge = resolve_knowledge(&extraction, "u-empty");
    assert!(knowledge.is_empty());
}
