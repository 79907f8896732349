//! Per-episode, per-stage checkpointing.
//!
//! One `stages.json` per episode under `$CHECKPOINT_DIR/<episodeId>/`,
//! written via atomic rename and guarded by an advisory lock file. A
//! `complete` record whose payload hash matches the stage's current input
//! means the stage is skipped entirely on re-runs; a changed hash
//! invalidates it. Stage artifacts (structurer output, extraction results,
//! embeddings) live beside the records so later stages can resume without
//! re-issuing LLM calls.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use podgraph_common::error::PodGraphError;

pub const STAGES_FILE: &str = "stages.json";
const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Structure,
    Extract,
    Embed,
    Persist,
    Cluster,
    Analyze,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Parse,
        Stage::Structure,
        Stage::Extract,
        Stage::Embed,
        Stage::Persist,
        Stage::Cluster,
        Stage::Analyze,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Structure => "structure",
            Stage::Extract => "extract",
            Stage::Embed => "embed",
            Stage::Persist => "persist",
            Stage::Cluster => "cluster",
            Stage::Analyze => "analyze",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub payload_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StagesFile {
    #[serde(default)]
    records: Vec<StageRecord>,
}

/// Outcome of `begin`: either the stage should run, or an identical input
/// already completed and the caller skips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    AlreadyDone,
}

pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Atomically mark the stage running. Returns `AlreadyDone` when a
    /// `complete` record with the same payload hash exists.
    pub fn begin(
        &self,
        episode_id: &str,
        stage: Stage,
        payload_hash: &str,
    ) -> Result<BeginOutcome, PodGraphError> {
        self.with_lock(episode_id, |path| {
            let mut file = load_stages(path)?;
            if let Some(record) = file.records.iter().find(|r| r.stage == stage) {
                if record.status == StageStatus::Complete && record.payload_hash == payload_hash {
                    debug!(episode_id, stage = %stage, "stage already complete, skipping");
                    return Ok(BeginOutcome::AlreadyDone);
                }
            }
            upsert_record(&mut file, stage, |record| {
                record.status = StageStatus::Running;
                record.payload_hash = payload_hash.to_string();
                record.completed_at = None;
                record.reason = None;
            });
            write_stages(path, &file)?;
            Ok(BeginOutcome::Started)
        })
    }

    pub fn complete(
        &self,
        episode_id: &str,
        stage: Stage,
        payload_hash: &str,
    ) -> Result<(), PodGraphError> {
        self.with_lock(episode_id, |path| {
            let mut file = load_stages(path)?;
            upsert_record(&mut file, stage, |record| {
                record.status = StageStatus::Complete;
                record.payload_hash = payload_hash.to_string();
                record.completed_at = Some(Utc::now());
                record.reason = None;
            });
            write_stages(path, &file)
        })
    }

    pub fn fail(&self, episode_id: &str, stage: Stage, reason: &str) -> Result<(), PodGraphError> {
        self.with_lock(episode_id, |path| {
            let mut file = load_stages(path)?;
            upsert_record(&mut file, stage, |record| {
                record.status = StageStatus::Failed;
                record.attempts += 1;
                record.reason = Some(reason.to_string());
            });
            write_stages(path, &file)
        })
    }

    pub fn status(&self, episode_id: &str) -> Result<Vec<StageRecord>, PodGraphError> {
        let path = self.episode_dir(episode_id).join(STAGES_FILE);
        Ok(load_stages(&path)?.records)
    }

    // -----------------------------------------------------------------------
    // Stage artifacts
    // -----------------------------------------------------------------------

    /// Persist a stage's output so later resumes can skip the stage without
    /// losing its result.
    pub fn save_artifact<T: Serialize>(
        &self,
        episode_id: &str,
        stage: Stage,
        artifact: &T,
    ) -> Result<(), PodGraphError> {
        let dir = self.episode_dir(episode_id);
        std::fs::create_dir_all(&dir).map_err(io_err)?;
        let path = dir.join(format!("{stage}.json"));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        serde_json::to_writer(&mut tmp, artifact)
            .map_err(|e| PodGraphError::Validation(format!("artifact serialize: {e}")))?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    pub fn load_artifact<T: DeserializeOwned>(
        &self,
        episode_id: &str,
        stage: Stage,
    ) -> Result<Option<T>, PodGraphError> {
        let path = self.episode_dir(episode_id).join(format!("{stage}.json"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| PodGraphError::Validation(format!("artifact {path:?}: {e}")))
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    fn with_lock<T>(
        &self,
        episode_id: &str,
        f: impl FnOnce(&Path) -> Result<T, PodGraphError>,
    ) -> Result<T, PodGraphError> {
        let dir = self.episode_dir(episode_id);
        std::fs::create_dir_all(&dir).map_err(io_err)?;
        let _guard = LockGuard::acquire(&dir.join(LOCK_FILE))?;
        f(&dir.join(STAGES_FILE))
    }

    fn episode_dir(&self, episode_id: &str) -> PathBuf {
        self.root.join(episode_id)
    }
}

/// Advisory lock: an exclusively-created file, removed on drop. Stale locks
/// older than the timeout are broken.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<Self, PodGraphError> {
        let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path) {
                        warn!(lock = %path.display(), "breaking stale checkpoint lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(PodGraphError::StorageUnavailable(format!(
                            "checkpoint lock {} held past timeout",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| {
            modified
                .elapsed()
                .map(|age| age > LOCK_TIMEOUT * 6)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

fn load_stages(path: &Path) -> Result<StagesFile, PodGraphError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| PodGraphError::Validation(format!("corrupt {path:?}: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StagesFile::default()),
        Err(e) => Err(io_err(e)),
    }
}

fn write_stages(path: &Path, file: &StagesFile) -> Result<(), PodGraphError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut tmp, file)
        .map_err(|e| PodGraphError::Validation(format!("stages serialize: {e}")))?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn upsert_record(file: &mut StagesFile, stage: Stage, update: impl FnOnce(&mut StageRecord)) {
    match file.records.iter_mut().find(|r| r.stage == stage) {
        Some(record) => update(record),
        None => {
            let mut record = StageRecord {
                stage,
                status: StageStatus::Pending,
                payload_hash: String::new(),
                completed_at: None,
                attempts: 0,
                reason: None,
            };
            update(&mut record);
            file.records.push(record);
        }
    }
}

fn io_err(e: std::io::Error) -> PodGraphError {
    PodGraphError::StorageUnavailable(format!("checkpoint io: {e}"))
}
