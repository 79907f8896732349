//! Embedding service: batched, cached, rate-limited.
//!
//! Batches of up to `EMBED_BATCH` texts run under the same credential
//! rotator as extraction. A per-process cache keyed by
//! `(modelId, sha256(text))` avoids re-embedding identical strings, with
//! per-key single-flight so concurrent callers of the same text produce one
//! provider call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use ai_client::EmbeddingProvider;
use podgraph_common::error::PodGraphError;
use podgraph_common::sha256_hex;

use crate::llm::{estimate_tokens, leased_call};
use crate::rotation::CredentialRotator;

/// Seam the orchestrator depends on; mocked in tests.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PodGraphError>;
}

enum CacheSlot {
    Ready(Vec<f32>),
    Pending(Arc<Notify>),
}

pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    rotator: Arc<CredentialRotator>,
    /// Used instead of the leased key when the embedding endpoint has its
    /// own credential.
    api_key_override: Option<String>,
    batch_size: usize,
    normalize: bool,
    cache: Mutex<HashMap<String, CacheSlot>>,
    max_retries: u32,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        rotator: Arc<CredentialRotator>,
        batch_size: usize,
        normalize: bool,
    ) -> Self {
        Self {
            provider,
            rotator,
            api_key_override: None,
            batch_size: batch_size.max(1),
            normalize,
            cache: Mutex::new(HashMap::new()),
            max_retries: 3,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        if !key.is_empty() {
            self.api_key_override = Some(key);
        }
        self
    }

    fn cache_key(&self, text: &str) -> String {
        sha256_hex(format!("{}\n{text}", self.provider.model()).as_bytes())
    }

    /// One rate-limited provider call for a chunk of texts, with retry and
    /// credential rotation on transient failures.
    async fn fetch_chunk(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>, PodGraphError> {
        let est: u32 = chunk.iter().map(|t| estimate_tokens(t)).sum();
        let mut attempt = 0;
        loop {
            let outcome = leased_call(&self.rotator, est, |lease| async {
                let api_key = self
                    .api_key_override
                    .as_deref()
                    .unwrap_or(&lease.api_key)
                    .to_string();
                let result = self
                    .provider
                    .embed_batch(&api_key, chunk)
                    .await
                    .map(|vectors| (vectors, est));
                (lease, result)
            })
            .await;

            match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries || !e.is_retryable() {
                        return Err(e.into_pipeline_error());
                    }
                    let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt - 1));
                    debug!(attempt, "embedding call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl TextEmbedder for EmbeddingService {
    fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PodGraphError> {
        let dim = self.provider.dimension();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Cache keys this call claimed, in claim order, with every input
        // slot that wants each key (duplicates within the batch collapse
        // onto one fetch).
        let mut claimed: Vec<(String, String)> = Vec::new();
        let mut claimed_slots: HashMap<String, Vec<usize>> = HashMap::new();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                out[i] = Some(vec![0.0; dim]);
                continue;
            }
            let key = self.cache_key(text);
            if let Some(slots) = claimed_slots.get_mut(&key) {
                slots.push(i);
                continue;
            }
            // Resolve from the cache, waiting out other callers' in-flight
            // fetches of the same text.
            loop {
                let waiter = {
                    let mut cache = self.cache.lock().await;
                    match cache.get(&key) {
                        Some(CacheSlot::Ready(vector)) => {
                            out[i] = Some(vector.clone());
                            None
                        }
                        Some(CacheSlot::Pending(notify)) => Some(notify.clone()),
                        None => {
                            cache.insert(key.clone(), CacheSlot::Pending(Arc::new(Notify::new())));
                            claimed.push((key.clone(), text.clone()));
                            claimed_slots.insert(key.clone(), vec![i]);
                            None
                        }
                    }
                };
                match waiter {
                    Some(notify) => notify.notified().await,
                    None => break,
                }
            }
        }

        // Fetch claimed texts in batches; fill the cache and wake waiters.
        let mut fetched_until = 0;
        let mut failure: Option<PodGraphError> = None;
        for chunk in claimed.chunks(self.batch_size) {
            let chunk_texts: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();
            match self.fetch_chunk(&chunk_texts).await {
                Ok(vectors) => {
                    let mut cache = self.cache.lock().await;
                    for ((key, _), vector) in chunk.iter().zip(vectors.into_iter()) {
                        let mut vector = vector;
                        if self.normalize {
                            l2_normalize(&mut vector);
                        }
                        for slot in &claimed_slots[key] {
                            out[*slot] = Some(vector.clone());
                        }
                        if let Some(CacheSlot::Pending(notify)) =
                            cache.insert(key.clone(), CacheSlot::Ready(vector))
                        {
                            notify.notify_waiters();
                        }
                    }
                    fetched_until += chunk.len();
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Clear every claim we never fulfilled so waiters can retry on
            // their own instead of blocking forever.
            let mut cache = self.cache.lock().await;
            for (key, _) in claimed.iter().skip(fetched_until) {
                if let Some(CacheSlot::Pending(notify)) = cache.remove(key) {
                    notify.notify_waiters();
                }
            }
            return Err(e);
        }

        Ok(out
            .into_iter()
            .map(|slot| slot.expect("all slots resolved"))
            .collect())
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
