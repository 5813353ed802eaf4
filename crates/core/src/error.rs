use thiserror::Error;

/// Failure classes the ingest surface distinguishes for callers. Validation
/// failures never mutate state; persistence failures mean the fix was not
/// accepted and may be retried as-is.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
