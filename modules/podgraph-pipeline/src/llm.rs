//! Shared plumbing for rate-limited provider calls.

use std::future::Future;

use ai_client::ProviderError;

use podgraph_common::error::PodGraphError;

use crate::rotation::{CallResult, CredentialRotator, Lease};

/// Crude token estimate for window accounting: ~4 chars per token.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4).max(1) as u32
}

pub(crate) fn map_provider_err(e: &ProviderError) -> PodGraphError {
    match e {
        ProviderError::RateLimited { .. } => PodGraphError::RateLimit(e.to_string()),
        ProviderError::Transient(_) => PodGraphError::TransientProvider(e.to_string()),
        ProviderError::Http(inner) => {
            if e.is_transient() {
                PodGraphError::TransientProvider(inner.to_string())
            } else {
                PodGraphError::Extraction(inner.to_string())
            }
        }
        ProviderError::Auth(_) => PodGraphError::Config(e.to_string()),
        ProviderError::InvalidResponse(_) => PodGraphError::Extraction(e.to_string()),
    }
}

fn call_result_for(e: &ProviderError) -> CallResult {
    match e {
        ProviderError::RateLimited { retry_after } => CallResult::RateLimited {
            retry_after: *retry_after,
        },
        _ => CallResult::Failed,
    }
}

/// Acquire a credential lease, run the call, release with the actual token
/// cost. The closure returns the value plus the tokens actually consumed.
pub(crate) async fn leased_call<T, Fut>(
    rotator: &CredentialRotator,
    est_tokens: u32,
    call: impl FnOnce(Lease) -> Fut,
) -> Result<T, ProviderOutcome>
where
    Fut: Future<Output = (Lease, Result<(T, u32), ProviderError>)>,
{
    let lease = rotator
        .acquire(est_tokens)
        .await
        .map_err(ProviderOutcome::Pipeline)?;
    let (lease, result) = call(lease).await;
    match result {
        Ok((value, actual_tokens)) => {
            rotator.release(lease, actual_tokens, CallResult::Ok);
            Ok(value)
        }
        Err(e) => {
            rotator.release(lease, est_tokens, call_result_for(&e));
            Err(ProviderOutcome::Provider(e))
        }
    }
}

/// Either a pipeline-level failure (no credential) or a provider failure the
/// caller may retry.
pub(crate) enum ProviderOutcome {
    Pipeline(PodGraphError),
    Provider(ProviderError),
}

impl ProviderOutcome {
    pub(crate) fn into_pipeline_error(self) -> PodGraphError {
        match self {
            ProviderOutcome::Pipeline(e) => e,
            ProviderOutcome::Provider(e) => map_provider_err(&e),
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ProviderOutcome::Pipeline(_) => false,
            ProviderOutcome::Provider(e) => e.is_transient(),
        }
    }

    pub(crate) fn is_invalid_response(&self) -> bool {
        matches!(
            self,
            ProviderOutcome::Provider(ProviderError::InvalidResponse(_))
        )
    }
}
