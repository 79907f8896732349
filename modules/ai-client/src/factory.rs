use std::sync::Arc;

use crate::claude::Claude;
use crate::error::ProviderError;
use crate::openai::OpenAiEmbeddings;
use crate::traits::{EmbeddingProvider, LlmProvider};

/// A provider definition from configuration: the adapter class name plus its
/// free-form config object.
#[derive(Debug, Clone)]
pub struct ProviderDef {
    pub class: String,
    pub config: serde_json::Value,
}

impl ProviderDef {
    fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    fn config_usize(&self, key: &str) -> Option<usize> {
        self.config.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
    }
}

/// Build an LLM provider from a definition. Class names are matched
/// case-insensitively on their adapter family.
pub fn build_llm(def: &ProviderDef) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let class = def.class.to_lowercase();
    if class.contains("claude") || class.contains("anthropic") {
        let model = def
            .config_str("model")
            .unwrap_or("claude-sonnet-4-20250514")
            .to_string();
        let provider = match def.config_str("base_url") {
            Some(url) => Claude::with_base_url(model, url),
            None => Claude::new(model),
        };
        return Ok(Arc::new(provider));
    }
    Err(ProviderError::InvalidResponse(format!(
        "unknown LLM provider class '{}'",
        def.class
    )))
}

/// Build an embedding provider from a definition.
pub fn build_embeddings(def: &ProviderDef) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    let class = def.class.to_lowercase();
    if class.contains("openai") || class.contains("voyage") || class.contains("embedding") {
        let model = def
            .config_str("model")
            .unwrap_or("text-embedding-3-small")
            .to_string();
        let dimension = def.config_usize("dimension").unwrap_or(768);
        let mut provider = OpenAiEmbeddings::new(model, dimension);
        if let Some(url) = def.config_str("base_url") {
            provider = provider.with_base_url(url);
        }
        return Ok(Arc::new(provider));
    }
    Err(ProviderError::InvalidResponse(format!(
        "unknown embedding provider class '{}'",
        def.class
    )))
}
