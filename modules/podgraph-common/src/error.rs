use std::time::Duration;

use thiserror::Error;

/// How the orchestrator should react to a failure. Lower layers only
/// classify; the orchestrator is the sole retry/skip/abort policy maker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying with backoff (provider 5xx, timeout, rate limit, DB deadlock).
    Transient,
    /// Skip the unit, continue the episode (invalid JSON after repair, schema violation).
    Permanent,
    /// Abort the episode (DB unreachable past circuit threshold, bad config).
    Fatal,
}

#[derive(Error, Debug)]
pub enum PodGraphError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Constraint conflict: {0}")]
    ConstraintConflict(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("No credential available after waiting {0:?}")]
    NoCredentialAvailable(Duration),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PodGraphError {
    pub fn class(&self) -> FailureClass {
        match self {
            PodGraphError::TransientProvider(_)
            | PodGraphError::RateLimit(_)
            | PodGraphError::ConstraintConflict(_) => FailureClass::Transient,
            PodGraphError::Validation(_) | PodGraphError::Extraction(_) => FailureClass::Permanent,
            PodGraphError::StorageUnavailable(_)
            | PodGraphError::ResourceExhausted(_)
            | PodGraphError::Config(_)
            | PodGraphError::NoCredentialAvailable(_) => FailureClass::Fatal,
            PodGraphError::Cancelled(_) => FailureClass::Permanent,
            PodGraphError::Anyhow(_) => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, PodGraphError>;
