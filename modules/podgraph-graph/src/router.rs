use std::collections::HashMap;
use std::path::Path;

use tokio::sync::Mutex;
use tracing::{info, warn};

use podgraph_common::config::PodcastRegistry;
use podgraph_common::error::PodGraphError;
use podgraph_common::types::EpisodeMetadata;
use podgraph_common::lower_snake;

use crate::reader::GraphReader;
use crate::store::GraphStore;
use crate::{ensure_schema, GraphClient};

/// Podcast id used when a VTT cannot be attributed to any configured show.
pub const UNKNOWN_PODCAST: &str = "unknown_podcast";

/// Resolve which podcast a VTT belongs to. Order: NOTE metadata, a
/// `/podcasts/<id>/` path segment, a legacy `/transcripts/<name>/` segment
/// (normalized), then the unknown-podcast fallback.
pub fn resolve_podcast_id(metadata: &EpisodeMetadata, vtt_path: &Path) -> String {
    if let Some(id) = &metadata.podcast_id {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_lowercase();
        }
    }

    let segments: Vec<&str> = vtt_path
        .iter()
        .filter_map(|s| s.to_str())
        .collect();

    if let Some(pos) = segments.iter().position(|s| *s == "podcasts") {
        if let Some(id) = segments.get(pos + 1) {
            if !id.is_empty() {
                return id.to_lowercase();
            }
        }
    }

    if let Some(pos) = segments.iter().position(|s| *s == "transcripts") {
        if let Some(name) = segments.get(pos + 1) {
            // The legacy layout ends in the file itself; only treat the
            // segment as a podcast name when it is a directory level.
            if pos + 2 < segments.len() {
                let normalized = lower_snake(name);
                if !normalized.is_empty() {
                    return normalized;
                }
            }
        }
    }

    UNKNOWN_PODCAST.to_string()
}

/// Default connection settings for podcasts without an explicit database
/// block, taken from the environment config.
#[derive(Debug, Clone)]
pub struct ConnectionDefaults {
    pub uri: String,
    pub username: String,
    pub password: String,
}

/// Maps podcast ids to their graph databases. One bounded client pool per
/// podcast, created lazily on first use; the registry is static for the
/// process lifetime.
pub struct GraphRouter {
    registry: PodcastRegistry,
    defaults: ConnectionDefaults,
    db_batch: usize,
    clients: Mutex<HashMap<String, GraphClient>>,
}

impl GraphRouter {
    pub fn new(registry: PodcastRegistry, defaults: ConnectionDefaults, db_batch: usize) -> Self {
        Self {
            registry,
            defaults,
            db_batch,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &PodcastRegistry {
        &self.registry
    }

    /// Write-side store for a podcast. The returned store is bound to that
    /// podcast's database; cross-podcast writes are rejected at this seam.
    pub async fn store_for(&self, podcast_id: &str) -> Result<GraphStore, PodGraphError> {
        let client = self.client_for(podcast_id).await?;
        Ok(GraphStore::new(client, podcast_id, self.db_batch))
    }

    /// Read-side queries against a podcast's database.
    pub async fn reader_for(&self, podcast_id: &str) -> Result<GraphReader, PodGraphError> {
        let client = self.client_for(podcast_id).await?;
        Ok(GraphReader::new(client))
    }

    async fn client_for(&self, podcast_id: &str) -> Result<GraphClient, PodGraphError> {
        let podcast_id = podcast_id.to_lowercase();
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&podcast_id) {
            return Ok(client.clone());
        }

        let (uri, username, password, database) = match self.registry.get(&podcast_id) {
            Some(podcast) => match &podcast.database {
                Some(db) => (
                    db.uri.clone(),
                    db.username.clone().unwrap_or_else(|| self.defaults.username.clone()),
                    db.password.clone().unwrap_or_else(|| self.defaults.password.clone()),
                    podcast.database_name(),
                ),
                None => (
                    self.defaults.uri.clone(),
                    self.defaults.username.clone(),
                    self.defaults.password.clone(),
                    podcast.database_name(),
                ),
            },
            None => {
                if podcast_id != UNKNOWN_PODCAST {
                    warn!(podcast_id, "podcast not in registry, using default database");
                }
                (
                    self.defaults.uri.clone(),
                    self.defaults.username.clone(),
                    self.defaults.password.clone(),
                    podcast_id.clone(),
                )
            }
        };

        info!(podcast_id, database, "connecting podcast database");
        let client = GraphClient::connect(&uri, &username, &password, &database)
            .await
            .map_err(|e| PodGraphError::StorageUnavailable(e.to_string()))?;
        ensure_schema(&client)
            .await
            .map_err(|e| PodGraphError::StorageUnavailable(e.to_string()))?;

        clients.insert(podcast_id, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn meta(podcast_id: Option<&str>) -> EpisodeMetadata {
        EpisodeMetadata {
            podcast_id: podcast_id.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn note_metadata_wins() {
        let path = PathBuf::from("/data/podcasts/other_show/transcripts/ep.vtt");
        assert_eq!(resolve_podcast_id(&meta(Some("MFM")), &path), "mfm");
    }

    #[test]
    fn podcasts_path_segment_is_second() {
        let path = PathBuf::from("/data/podcasts/huberman-lab/transcripts/ep.vtt");
        assert_eq!(resolve_podcast_id(&meta(None), &path), "huberman-lab");
    }

    #[test]
    fn legacy_transcripts_segment_is_normalized() {
        let path = PathBuf::from("/data/transcripts/My Favorite Murder/ep1.vtt");
        assert_eq!(resolve_podcast_id(&meta(None), &path), "my_favorite_murder");
    }

    #[test]
    fn legacy_segment_that_is_the_file_itself_does_not_count() {
        let path = PathBuf::from("/data/transcripts/ep1.vtt");
        assert_eq!(resolve_podcast_id(&meta(None), &path), UNKNOWN_PODCAST);
    }

    #[test]
    fn fallback_is_unknown_podcast() {
        let path = PathBuf::from("/tmp/whatever/ep1.vtt");
        assert_eq!(resolve_podcast_id(&meta(None), &path), UNKNOWN_PODCAST);
        assert_eq!(resolve_podcast_id(&meta(Some("  ")), &path), UNKNOWN_PODCAST);
    }
}
