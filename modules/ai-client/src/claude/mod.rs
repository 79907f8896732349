mod client;
pub(crate) mod types;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::traits::{LlmProvider, StructuredCall, StructuredReply};

use client::ClaudeClient;
use types::*;

/// Anthropic messages-API provider. Structured output is obtained by
/// forcing a single tool call whose input schema is the caller's schema.
pub struct Claude {
    model: String,
    client: ClaudeClient,
}

impl Claude {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            client: ClaudeClient::new(None),
        }
    }

    pub fn with_base_url(model: impl Into<String>, base_url: &str) -> Self {
        Self {
            model: model.into(),
            client: ClaudeClient::new(Some(base_url)),
        }
    }
}

const STRUCTURED_TOOL: &str = "structured_response";

#[async_trait]
impl LlmProvider for Claude {
    fn model(&self) -> &str {
        &self.model
    }

    async fn extract_structured(
        &self,
        api_key: &str,
        call: &StructuredCall,
    ) -> Result<StructuredReply, ProviderError> {
        let mut request = ChatRequest::new(&self.model)
            .system(&call.system)
            .message(WireMessage::user(&call.user))
            .max_tokens(call.max_tokens)
            .temperature(call.temperature)
            .tool(ToolDefinitionWire {
                name: STRUCTURED_TOOL.to_string(),
                description: "Record the extraction result.".to_string(),
                input_schema: call.schema.clone(),
            });
        request.tool_choice = Some(serde_json::json!({
            "type": "tool",
            "name": STRUCTURED_TOOL,
        }));

        let response = self.client.chat(api_key, &request).await?;

        let (input_tokens, output_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));

        let value = response
            .tool_input(STRUCTURED_TOOL)
            .cloned()
            .ok_or_else(|| {
                ProviderError::InvalidResponse("no structured output in response".to_string())
            })?;

        Ok(StructuredReply {
            value,
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_carries_model() {
        let ai = Claude::new("claude-sonnet-4-20250514");
        assert_eq!(ai.model(), "claude-sonnet-4-20250514");
    }
}
