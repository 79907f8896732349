use tracing::debug;

use crate::error::{classify_status, retry_after_header, ProviderError};

use super::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct ClaudeClient {
    http: reqwest::Client,
    base_url: String,
}

impl ClaudeClient {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or(ANTHROPIC_API_URL).to_string(),
        }
    }

    pub async fn chat(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/messages", self.base_url);

        debug!(model = %request.model, "Claude chat request");

        let response = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("malformed response body: {e}")))
    }
}
