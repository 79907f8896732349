use std::time::Duration;

use thiserror::Error;

/// Typed provider failures. Callers (the credential rotator and the
/// orchestrator) branch on the kind, never on message text.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    /// Whether a retry with backoff (possibly on another credential) makes sense.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Transient(_) => true,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Auth(_) | ProviderError::InvalidResponse(_) => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

/// Map an HTTP error status (plus headers already extracted) to a kind.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> ProviderError {
    if status.as_u16() == 429 {
        return ProviderError::RateLimited { retry_after };
    }
    if status.is_server_error() || status.as_u16() == 408 {
        return ProviderError::Transient(format!("{status}: {body}"));
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return ProviderError::Auth(format!("{status}: {body}"));
    }
    ProviderError::InvalidResponse(format!("{status}: {body}"))
}

pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
