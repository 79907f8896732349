//! Provider-agnostic AI clients.
//!
//! Capability traits (`LlmProvider`, `EmbeddingProvider`) with concrete
//! adapters for the Anthropic messages API and OpenAI-compatible embedding
//! endpoints. Credentials are passed per call so a rotator can multiplex a
//! key pool over one provider instance. Errors carry typed kinds, not
//! policy; retry decisions belong to the caller.

pub mod claude;
pub mod error;
pub mod factory;
pub mod openai;
pub mod traits;

pub use error::ProviderError;
pub use factory::{build_embeddings, build_llm, ProviderDef};
pub use traits::{schema_of, EmbeddingProvider, LlmProvider, StructuredCall, StructuredReply};
