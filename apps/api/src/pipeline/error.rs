use thiserror::Error;
use uuid::Uuid;

/// Error classes that decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or ineligible owner. Surfaced immediately, never retried.
    Validation,
    /// Broker, database, storage or network trouble. Retried by the queue.
    TransientInfra,
    /// The document itself cannot be analysed. Terminal.
    Content,
    /// A collaborator failed or answered with malformed output. Retried.
    Service,
    /// The job refers to a record that no longer exists. Terminal, nothing to update.
    Stale,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("Monthly analysis limit reached. Upgrade to premium for unlimited analyses.")]
    QuotaExceeded,

    #[error("Analysis {0} no longer exists")]
    RecordMissing(Uuid),

    #[error("{0}")]
    Content(String),

    #[error("{0}")]
    TransientInfra(String),

    #[error("{0}")]
    Service(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) | PipelineError::QuotaExceeded => ErrorKind::Validation,
            PipelineError::RecordMissing(_) => ErrorKind::Stale,
            PipelineError::Content(_) => ErrorKind::Content,
            PipelineError::TransientInfra(_) => ErrorKind::TransientInfra,
            PipelineError::Service(_) => ErrorKind::Service,
        }
    }

    /// Whether the queue's retry budget should be spent on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientInfra | ErrorKind::Service
        )
    }

    /// Wraps a store or broker failure.
    pub fn infra(err: impl std::fmt::Display) -> Self {
        PipelineError::TransientInfra(err.to_string())
    }
}
