use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

use crate::error::ProviderError;

// =============================================================================
// Structured calls
// =============================================================================

/// One structured-extraction call. The credential is passed per call so a
/// rotator can multiplex a key pool over a single provider instance.
#[derive(Debug, Clone)]
pub struct StructuredCall {
    pub system: String,
    pub user: String,
    /// JSON schema the reply must validate against.
    pub schema: serde_json::Value,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl StructuredCall {
    pub fn new(system: impl Into<String>, user: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            schema,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Raw structured reply plus token accounting for rate-limit windows.
#[derive(Debug, Clone)]
pub struct StructuredReply {
    pub value: serde_json::Value,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl StructuredReply {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Deserialize into a typed structure. Failure is `InvalidResponse`, so
    /// callers can issue a schema-reminder repair retry.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| ProviderError::InvalidResponse(format!("schema mismatch: {e}")))
    }
}

/// Derive the JSON schema for an LLM-facing type.
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schema_for!(T)).expect("schema serialization cannot fail")
}

// =============================================================================
// Capability traits
// =============================================================================

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model(&self) -> &str;

    /// Issue one structured-output call with the given credential.
    async fn extract_structured(
        &self,
        api_key: &str,
        call: &StructuredCall,
    ) -> Result<StructuredReply, ProviderError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    /// Fixed output dimension for this model.
    fn dimension(&self) -> usize;

    /// Embed a batch, order-preserving.
    async fn embed_batch(
        &self,
        api_key: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}
