use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PodGraphError;

// ---------------------------------------------------------------------------
// Environment configuration
// ---------------------------------------------------------------------------

/// Process-level configuration loaded from environment variables once at
/// startup. Podcast-specific settings live in `podcasts.yaml` (below).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for rotation/checkpoint state. `STATE_DIR`, default `data/`.
    pub state_dir: PathBuf,
    /// Checkpoint location. `CHECKPOINT_DIR`, default `$STATE_DIR/checkpoints`.
    pub checkpoint_dir: PathBuf,
    /// Root of the input VTT tree. `TRANSCRIPT_OUTPUT_DIR`.
    pub transcript_output_dir: PathBuf,
    /// `LOG_LEVEL`: DEBUG|INFO|WARNING|ERROR.
    pub log_level: String,
    /// Selects the LLM facade variant from providers.yaml. `LLM_SERVICE_TYPE`.
    pub llm_service_type: String,

    // Resource ceilings
    pub max_memory_mb: u64,
    pub max_episodes_concurrent: usize,
    pub max_concurrent_units: usize,
    pub embed_batch: usize,
    pub db_batch: usize,
    pub max_wait_for_credential: Duration,
    /// Per-unit extraction timeout. `KNOWLEDGE_EXTRACTION_TIMEOUT` (seconds).
    pub knowledge_extraction_timeout: Duration,

    // Provider credentials
    /// Pool of LLM API keys for the credential rotator.
    pub llm_api_keys: Vec<String>,
    pub embeddings_api_key: String,

    // Graph defaults for podcasts without an explicit database block
    pub graph_uri: String,
    pub graph_username: String,
    pub graph_password: String,
}

impl Config {
    pub fn from_env() -> Result<Self, PodGraphError> {
        let state_dir = PathBuf::from(env_or("STATE_DIR", "data"));
        let checkpoint_dir = env::var("CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("checkpoints"));

        let llm_api_keys = env::var("LLM_API_KEYS")
            .or_else(|_| env::var("GOOGLE_API_KEY"))
            .or_else(|_| env::var("ANTHROPIC_API_KEY"))
            .map_err(|_| {
                PodGraphError::Config(
                    "no LLM credentials: set LLM_API_KEYS (comma-separated) or a provider key"
                        .to_string(),
                )
            })?
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>();
        if llm_api_keys.is_empty() {
            return Err(PodGraphError::Config("LLM_API_KEYS is empty".to_string()));
        }

        Ok(Self {
            state_dir,
            checkpoint_dir,
            transcript_output_dir: PathBuf::from(env_or("TRANSCRIPT_OUTPUT_DIR", "transcripts")),
            log_level: env_or("LOG_LEVEL", "INFO"),
            llm_service_type: env_or("LLM_SERVICE_TYPE", "default"),
            max_memory_mb: parse_env("MAX_MEMORY_MB", 2048)?,
            max_episodes_concurrent: parse_env("MAX_EPISODES_CONCURRENT", 2)?,
            max_concurrent_units: parse_env("MAX_CONCURRENT_UNITS", 4)?,
            embed_batch: parse_env("EMBED_BATCH", 32)?,
            db_batch: parse_env("DB_BATCH", 500)?,
            max_wait_for_credential: Duration::from_secs(parse_env(
                "MAX_WAIT_FOR_CREDENTIAL",
                120,
            )?),
            knowledge_extraction_timeout: Duration::from_secs(parse_env(
                "KNOWLEDGE_EXTRACTION_TIMEOUT",
                1800,
            )?),
            llm_api_keys,
            embeddings_api_key: env_or("EMBEDDINGS_API_KEY", ""),
            graph_uri: env_or("GRAPH_URI", "bolt://localhost:7687"),
            graph_username: env_or("GRAPH_USERNAME", "neo4j"),
            graph_password: env_or("GRAPH_PASSWORD", ""),
        })
    }

    /// Log the configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            state_dir = %self.state_dir.display(),
            checkpoint_dir = %self.checkpoint_dir.display(),
            transcript_output_dir = %self.transcript_output_dir.display(),
            llm_service_type = %self.llm_service_type,
            max_episodes_concurrent = self.max_episodes_concurrent,
            max_concurrent_units = self.max_concurrent_units,
            embed_batch = self.embed_batch,
            db_batch = self.db_batch,
            llm_api_keys = self.llm_api_keys.len(),
            embeddings_api_key = if self.embeddings_api_key.is_empty() { "not set" } else { "***" },
            graph_uri = %self.graph_uri,
            graph_password = if self.graph_password.is_empty() { "not set" } else { "***" },
            "Configuration loaded"
        );
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, PodGraphError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| {
            PodGraphError::Config(format!("{key} must be a number, got '{raw}'"))
        }),
    }
}

// ---------------------------------------------------------------------------
// podcasts.yaml
// ---------------------------------------------------------------------------

/// Database block for a podcast. Fields default from the env config when
/// absent; the database name defaults to the podcast id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DatabaseConfig {
    fn validate(&self) -> Result<(), PodGraphError> {
        const SCHEMES: [&str; 4] = ["neo4j://", "neo4j+s://", "bolt://", "bolt+s://"];
        if !SCHEMES.iter().any(|s| self.uri.starts_with(s)) {
            return Err(PodGraphError::Config(format!(
                "database uri '{}' must start with one of {SCHEMES:?}",
                self.uri
            )));
        }
        Ok(())
    }
}

/// Per-podcast processing overrides. Unset fields fall back to the registry
/// defaults, then to the built-in values in `ProcessingSettings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub enable_flow_analysis: Option<bool>,
    #[serde(default)]
    pub enable_graph_enhancement: Option<bool>,
    #[serde(default)]
    pub use_large_context: Option<bool>,
}

/// Fully-resolved processing settings after default merging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingSettings {
    pub batch_size: u32,
    pub max_retries: u32,
    pub enable_flow_analysis: bool,
    pub enable_graph_enhancement: bool,
    pub use_large_context: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            enable_flow_analysis: true,
            enable_graph_enhancement: true,
            use_large_context: true,
        }
    }
}

impl ProcessingConfig {
    pub fn resolve(&self, defaults: &ProcessingConfig) -> ProcessingSettings {
        let built_in = ProcessingSettings::default();
        ProcessingSettings {
            batch_size: self
                .batch_size
                .or(defaults.batch_size)
                .unwrap_or(built_in.batch_size),
            max_retries: self
                .max_retries
                .or(defaults.max_retries)
                .unwrap_or(built_in.max_retries),
            enable_flow_analysis: self
                .enable_flow_analysis
                .or(defaults.enable_flow_analysis)
                .unwrap_or(built_in.enable_flow_analysis),
            enable_graph_enhancement: self
                .enable_graph_enhancement
                .or(defaults.enable_graph_enhancement)
                .unwrap_or(built_in.enable_graph_enhancement),
            use_large_context: self
                .use_large_context
                .or(defaults.use_large_context)
                .unwrap_or(built_in.use_large_context),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodcastMetadata {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodcastConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub metadata: PodcastMetadata,
    #[serde(default)]
    pub transcript_dir: Option<String>,
    #[serde(default)]
    pub processed_dir: Option<String>,
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
}

fn default_true() -> bool {
    true
}

impl PodcastConfig {
    /// Database name for this podcast: explicit `database_name` or the id.
    pub fn database_name(&self) -> String {
        self.database
            .as_ref()
            .and_then(|d| d.database_name.clone())
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn transcript_path(&self, base: &Path) -> PathBuf {
        match &self.transcript_dir {
            Some(dir) => base.join(dir),
            None => base.join("podcasts").join(&self.id).join("transcripts"),
        }
    }

    pub fn processed_path(&self, base: &Path) -> Option<PathBuf> {
        self.processed_dir.as_ref().map(|dir| base.join(dir))
    }

    fn validate(&self) -> Result<(), PodGraphError> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(PodGraphError::Config(format!(
                "podcast id '{}' must match [a-z0-9_-]+",
                self.id
            )));
        }
        if let Some(db) = &self.database {
            db.validate()?;
        }
        let lang_re = language_regex();
        if !lang_re.is_match(&self.metadata.language) {
            return Err(PodGraphError::Config(format!(
                "podcast '{}': language '{}' is not an ISO-639-1 code",
                self.id, self.metadata.language
            )));
        }
        Ok(())
    }
}

fn language_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z]{2}(-[A-Z]{2})?$").unwrap())
}

/// The static multi-podcast registry loaded from `podcasts.yaml` at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodcastRegistry {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub defaults: ProcessingConfig,
    pub podcasts: Vec<PodcastConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PodcastRegistry {
    pub fn load(path: &Path) -> Result<Self, PodGraphError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PodGraphError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, PodGraphError> {
        let registry: PodcastRegistry = serde_yaml::from_str(raw)
            .map_err(|e| PodGraphError::Config(format!("podcasts.yaml: {e}")))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), PodGraphError> {
        let mut seen = std::collections::HashSet::new();
        for podcast in &self.podcasts {
            podcast.validate()?;
            if !seen.insert(podcast.id.as_str()) {
                return Err(PodGraphError::Config(format!(
                    "duplicate podcast id '{}'",
                    podcast.id
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, podcast_id: &str) -> Option<&PodcastConfig> {
        let wanted = podcast_id.to_lowercase();
        self.podcasts.iter().find(|p| p.id == wanted)
    }

    pub fn enabled_podcasts(&self) -> impl Iterator<Item = &PodcastConfig> {
        self.podcasts.iter().filter(|p| p.enabled)
    }

    /// Resolved processing settings for a podcast (registry defaults applied).
    pub fn settings_for(&self, podcast_id: &str) -> ProcessingSettings {
        self.get(podcast_id)
            .map(|p| p.processing.resolve(&self.defaults))
            .unwrap_or_else(|| ProcessingConfig::default().resolve(&self.defaults))
    }
}

// ---------------------------------------------------------------------------
// providers.yaml
// ---------------------------------------------------------------------------

/// One provider entry: `{class, version, config}` under a provider-type →
/// provider-name map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
    pub class: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
}

impl ProviderSpec {
    pub fn config_str(&self, key: &str) -> Option<String> {
        self.config
            .get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| v.as_f64())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub llm: HashMap<String, ProviderSpec>,
    #[serde(default)]
    pub embeddings: HashMap<String, ProviderSpec>,
    #[serde(default)]
    pub graph: HashMap<String, ProviderSpec>,
}

impl ProvidersConfig {
    pub fn load(path: &Path) -> Result<Self, PodGraphError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PodGraphError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| PodGraphError::Config(format!("providers.yaml: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
defaults:
  batch_size: 5
  max_retries: 2
podcasts:
  - id: my_favorite_murder
    name: My Favorite Murder
    enabled: true
    database:
      uri: bolt://localhost:7687
      database_name: mfm
    processing:
      batch_size: 20
    metadata:
      language: en
      host: Karen and Georgia
  - id: huberman-lab
    name: Huberman Lab
    enabled: false
"#;

    #[test]
    fn parses_registry_and_merges_defaults() {
        let reg = PodcastRegistry::parse(SAMPLE).unwrap();
        assert_eq!(reg.podcasts.len(), 2);

        let settings = reg.settings_for("my_favorite_murder");
        assert_eq!(settings.batch_size, 20); // podcast override
        assert_eq!(settings.max_retries, 2); // registry default

        let settings = reg.settings_for("huberman-lab");
        assert_eq!(settings.batch_size, 5);
        assert!(settings.use_large_context); // built-in
    }

    #[test]
    fn enabled_filter_and_database_name() {
        let reg = PodcastRegistry::parse(SAMPLE).unwrap();
        let enabled: Vec<_> = reg.enabled_podcasts().map(|p| p.id.as_str()).collect();
        assert_eq!(enabled, vec!["my_favorite_murder"]);
        assert_eq!(reg.get("my_favorite_murder").unwrap().database_name(), "mfm");
        assert_eq!(reg.get("huberman-lab").unwrap().database_name(), "huberman-lab");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = "podcasts:\n  - id: a\n    name: A\n    transcripts_dir: typo\n";
        assert!(PodcastRegistry::parse(raw).is_err());
    }

    #[test]
    fn bad_uri_scheme_is_rejected() {
        let raw = "podcasts:\n  - id: a\n    name: A\n    database:\n      uri: http://x\n";
        assert!(PodcastRegistry::parse(raw).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = "podcasts:\n  - id: a\n    name: A\n  - id: a\n    name: B\n";
        assert!(PodcastRegistry::parse(raw).is_err());
    }

    #[test]
    fn bad_podcast_id_is_rejected() {
        let raw = "podcasts:\n  - id: 'Bad Id'\n    name: A\n";
        assert!(PodcastRegistry::parse(raw).is_err());
    }

    #[test]
    fn providers_config_lookups() {
        let raw = r#"
llm:
  gemini:
    class: GeminiAdapter
    version: "2.0"
    config:
      model: gemini-2.0-flash
      temperature: 0.1
embeddings:
  sentence_transformer:
    class: SentenceTransformerAdapter
    config:
      dimension: 384
"#;
        let cfg: ProvidersConfig = serde_yaml::from_str(raw).unwrap();
        let spec = cfg.llm.get("gemini").unwrap();
        assert_eq!(spec.class, "GeminiAdapter");
        assert_eq!(spec.config_str("model").unwrap(), "gemini-2.0-flash");
        assert_eq!(spec.config_f64("temperature").unwrap(), 0.1);
        assert_eq!(
            cfg.embeddings
                .get("sentence_transformer")
                .unwrap()
                .config_u64("dimension")
                .unwrap(),
            384
        );
    }
}
