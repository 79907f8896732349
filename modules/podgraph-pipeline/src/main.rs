use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ai_client::ProviderDef;
use podgraph_common::config::{Config, PodcastRegistry, ProviderSpec, ProvidersConfig};
use podgraph_common::error::PodGraphError;
use podgraph_graph::{
    resolve_podcast_id, ConnectionDefaults, GraphRouter, DEFAULT_ASSIGN_THRESHOLD,
};
use podgraph_pipeline::{
    CheckpointManager, CredentialRotator, EmbeddingService, EpisodeJob, EpisodeStatus, Extractor,
    FailureKind, GraphPostProcessor, Orchestrator, OrchestratorConfig, PipelineMetrics,
    RotationConfig, RunSummary, Structurer,
};

const EXIT_OK: u8 = 0;
const EXIT_GENERIC: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_STORAGE: u8 = 3;
const EXIT_CREDENTIALS: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "podgraph",
    about = "Podcast transcript → knowledge graph seeding pipeline"
)]
struct Cli {
    /// Podcast registry file.
    #[arg(long, default_value = "config/podcasts.yaml")]
    podcasts_config: PathBuf,

    /// Provider registry file.
    #[arg(long, default_value = "config/providers.yaml")]
    providers_config: PathBuf,

    /// Explicit VTT files to process; when empty, the transcript tree of
    /// every enabled podcast is scanned.
    vtt_files: Vec<PathBuf>,

    /// Delete one episode (and its owned knowledge) from a podcast's
    /// database, then exit. Requires --podcast.
    #[arg(long, value_name = "EPISODE_ID")]
    delete_episode: Option<String>,

    /// Podcast id for --delete-episode.
    #[arg(long)]
    podcast: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing();
    info!("podgraph pipeline starting...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    config.log_redacted();

    match run(cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "pipeline error");
            let code = match e.downcast_ref::<PodGraphError>() {
                Some(PodGraphError::Config(_)) => EXIT_CONFIG,
                Some(PodGraphError::StorageUnavailable(_)) => EXIT_STORAGE,
                Some(PodGraphError::NoCredentialAvailable(_)) => EXIT_CREDENTIALS,
                _ => EXIT_GENERIC,
            };
            ExitCode::from(code)
        }
    }
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL")
        .map(|l| match l.to_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        })
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("podgraph={level},ai_client={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli, config: Config) -> Result<u8> {
    // --- registries ---
    let registry = if cli.podcasts_config.exists() {
        PodcastRegistry::load(&cli.podcasts_config)?
    } else {
        warn!(
            path = %cli.podcasts_config.display(),
            "no podcast registry found, running with defaults only"
        );
        PodcastRegistry::parse("podcasts: []")?
    };

    let providers = if cli.providers_config.exists() {
        ProvidersConfig::load(&cli.providers_config)?
    } else {
        ProvidersConfig::default()
    };

    // --- shared services ---
    let router = Arc::new(GraphRouter::new(
        registry.clone(),
        ConnectionDefaults {
            uri: config.graph_uri.clone(),
            username: config.graph_username.clone(),
            password: config.graph_password.clone(),
        },
        config.db_batch,
    ));

    // --- admin: delete episode ---
    if let Some(episode_id) = &cli.delete_episode {
        let podcast_id = cli
            .podcast
            .as_deref()
            .ok_or_else(|| PodGraphError::Config("--delete-episode requires --podcast".into()))?;
        let store = router.store_for(podcast_id).await?;
        store.delete_episode(episode_id).await?;
        info!(episode_id, podcast_id, "episode deleted");
        return Ok(EXIT_OK);
    }

    let rotator = Arc::new(CredentialRotator::new(
        config.llm_api_keys.clone(),
        RotationConfig {
            max_wait: config.max_wait_for_credential,
            ..RotationConfig::default()
        },
        Some(&config.state_dir),
    )?);
    rotator.cleanup_old_snapshots();

    let metrics = Arc::new(PipelineMetrics::default());
    metrics.on_anomaly(|anomaly| {
        warn!(rate = anomaly.rate, window = anomaly.window, "anomaly callback fired");
    });

    let llm = ai_client::build_llm(&llm_def(&providers, &config.llm_service_type))
        .map_err(|e| PodGraphError::Config(e.to_string()))?;
    let embeddings = ai_client::build_embeddings(&embeddings_def(&providers))
        .map_err(|e| PodGraphError::Config(e.to_string()))?;

    let structurer = Arc::new(Structurer::new(llm.clone(), rotator.clone()));
    let extractor = Arc::new(Extractor::new(llm.clone(), rotator.clone()));
    let embedder = Arc::new(
        EmbeddingService::new(embeddings, rotator.clone(), config.embed_batch, true)
            .with_api_key(config.embeddings_api_key.clone()),
    );
    let post = Arc::new(GraphPostProcessor::new(
        router.clone(),
        llm,
        rotator.clone(),
        DEFAULT_ASSIGN_THRESHOLD,
    ));
    let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint_dir.clone()));

    let orchestrator = Orchestrator::new(
        structurer,
        extractor,
        embedder,
        post,
        checkpoints,
        metrics.clone(),
        OrchestratorConfig {
            max_episodes_concurrent: config.max_episodes_concurrent,
            max_concurrent_units: config.max_concurrent_units,
            unit_timeout: config.knowledge_extraction_timeout,
        },
    );

    // --- job discovery ---
    let jobs = discover_jobs(&cli, &config, &registry, &router).await?;
    if jobs.is_empty() {
        info!("no VTT files to process");
        return Ok(EXIT_OK);
    }
    info!(jobs = jobs.len(), "episodes queued");

    // --- run, with SIGINT cancelling the pipeline ---
    let cancel = orchestrator.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pipeline");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run(jobs).await;
    interrupt.abort();

    move_processed_files(&summary, &registry, &config);

    if let Some(mb) = resident_memory_mb() {
        metrics.set_memory_mb(mb);
    }
    info!("{summary}");
    info!("{}", metrics.snapshot());

    Ok(exit_code_for(&summary))
}

/// Resident set size in MiB, from procfs where available.
fn resident_memory_mb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096 / (1024 * 1024))
}

/// Move fully-processed VTT files into the podcast's `processed_dir`, when
/// one is configured.
fn move_processed_files(summary: &RunSummary, registry: &PodcastRegistry, config: &Config) {
    for outcome in &summary.outcomes {
        if outcome.status != EpisodeStatus::Completed {
            continue;
        }
        let Some(processed_dir) = registry
            .get(&outcome.podcast_id)
            .and_then(|p| p.processed_path(&config.transcript_output_dir))
        else {
            continue;
        };
        let Some(file_name) = outcome.vtt_path.file_name() else {
            continue;
        };
        if let Err(e) = std::fs::create_dir_all(&processed_dir)
            .and_then(|_| std::fs::rename(&outcome.vtt_path, processed_dir.join(file_name)))
        {
            warn!(
                path = %outcome.vtt_path.display(),
                error = %e,
                "could not move processed VTT"
            );
        }
    }
}

fn llm_def(providers: &ProvidersConfig, service_type: &str) -> ProviderDef {
    let spec = providers
        .llm
        .get(service_type)
        .or_else(|| providers.llm.values().next());
    match spec {
        Some(spec) => provider_def(spec),
        None => ProviderDef {
            class: "claude".to_string(),
            config: serde_json::Value::Null,
        },
    }
}

fn embeddings_def(providers: &ProvidersConfig) -> ProviderDef {
    match providers.embeddings.values().next() {
        Some(spec) => provider_def(spec),
        None => ProviderDef {
            class: "openai-embeddings".to_string(),
            config: serde_json::Value::Null,
        },
    }
}

fn provider_def(spec: &ProviderSpec) -> ProviderDef {
    let config = serde_json::to_value(&spec.config).unwrap_or(serde_json::Value::Null);
    ProviderDef {
        class: spec.class.clone(),
        config,
    }
}

async fn discover_jobs(
    cli: &Cli,
    config: &Config,
    registry: &PodcastRegistry,
    router: &Arc<GraphRouter>,
) -> Result<Vec<EpisodeJob>> {
    let mut inputs: Vec<(PathBuf, String)> = Vec::new();

    if cli.vtt_files.is_empty() {
        // Scan every enabled podcast's transcript tree.
        for podcast in registry.enabled_podcasts() {
            let dir = podcast.transcript_path(&config.transcript_output_dir);
            if !dir.exists() {
                warn!(podcast = podcast.id.as_str(), dir = %dir.display(), "transcript dir missing");
                continue;
            }
            for path in find_vtt_files(&dir)? {
                inputs.push((path, podcast.id.clone()));
            }
        }
    } else {
        // Explicit files: route each by NOTE metadata, then path shape.
        for path in &cli.vtt_files {
            let metadata = podgraph_vtt::peek_metadata(path)
                .with_context(|| format!("unreadable VTT {}", path.display()))?;
            let podcast_id = resolve_podcast_id(&metadata, path);
            inputs.push((path.clone(), podcast_id));
        }
    }

    inputs.sort();
    inputs.dedup();

    let mut jobs = Vec::with_capacity(inputs.len());
    for (path, podcast_id) in inputs {
        let podcast_name = registry
            .get(&podcast_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| podcast_id.clone());
        let store = router.store_for(&podcast_id).await?;
        jobs.push(EpisodeJob {
            vtt_path: path,
            podcast_id,
            podcast_name,
            sink: Arc::new(store),
        });
    }
    Ok(jobs)
}

fn find_vtt_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("cannot read {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "vtt") {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn exit_code_for(summary: &RunSummary) -> u8 {
    if summary
        .outcomes
        .iter()
        .any(|o| o.status == EpisodeStatus::Cancelled)
    {
        return EXIT_INTERRUPTED;
    }
    let failed: Vec<_> = summary
        .outcomes
        .iter()
        .filter(|o| o.status == EpisodeStatus::Failed)
        .collect();
    if failed.is_empty() {
        return EXIT_OK;
    }
    if failed
        .iter()
        .all(|o| o.failure_kind == Some(FailureKind::Storage))
    {
        return EXIT_STORAGE;
    }
    if failed
        .iter()
        .all(|o| o.failure_kind == Some(FailureKind::Credentials))
    {
        return EXIT_CREDENTIALS;
    }
    EXIT_GENERIC
}
