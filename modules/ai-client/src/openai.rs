use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{classify_status, retry_after_header, ProviderError};
use crate::traits::EmbeddingProvider;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Embeddings over any OpenAI-compatible `/embeddings` endpoint. Voyage and
/// friends work by overriding the base url.
pub struct OpenAiEmbeddings {
    model: String,
    dimension: usize,
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiEmbeddings {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            http: reqwest::Client::new(),
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(
        &self,
        api_key: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);

        debug!(model = %self.model, batch = texts.len(), "embedding request");

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("malformed response body: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        // The API may reorder; `index` restores input order.
        let mut out = vec![Vec::new(); texts.len()];
        for datum in parsed.data {
            if datum.index >= out.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "embedding index {} out of range",
                    datum.index
                )));
            }
            if datum.embedding.len() != self.dimension {
                return Err(ProviderError::InvalidResponse(format!(
                    "embedding dimension {} != configured {}",
                    datum.embedding.len(),
                    self.dimension
                )));
            }
            out[datum.index] = datum.embedding;
        }
        Ok(out)
    }
}
