//! Typed errors for the review engine.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling. Job-level failures are not
//! errors in this sense: they are recorded on the job as a [`JobError`]
//! carrying a machine-readable [`ErrorCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ids::JobId;

/// Errors returned by engine operations and collaborator adapters.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// Language model call failed at the transport level
    #[error("language model error: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Knowledge source or authoritative source call failed
    #[error("knowledge source error: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A call did not finish within its time box
    #[error("timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Job id is unknown to the orchestrator and the store
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Request rejected before a job was created
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Model output failed validation on both attempts
    #[error("{operation} output failed validation twice: {reason}")]
    MalformedOutput { operation: String, reason: String },

    /// Contract violation inside the engine
    #[error("internal fault: {0}")]
    Internal(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl ReviewError {
    /// Machine-readable code for this error when it ends a task or a job.
    pub fn code(&self) -> ErrorCode {
        match self {
            ReviewError::Model(_) | ReviewError::Source(_) => ErrorCode::ProviderError,
            ReviewError::Timeout { .. } => ErrorCode::TaskTimeout,
            ReviewError::Cancelled => ErrorCode::Cancelled,
            ReviewError::JsonParse(_) | ReviewError::MalformedOutput { .. } => {
                ErrorCode::MalformedOutput
            }
            ReviewError::Storage(_)
            | ReviewError::JobNotFound(_)
            | ReviewError::InvalidRequest { .. }
            | ReviewError::Config(_)
            | ReviewError::Internal(_) => ErrorCode::InternalFault,
        }
    }

    /// Whether a task-level retry is allowed for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReviewError::Model(_) | ReviewError::Source(_))
    }
}

/// Machine-readable failure codes stored on jobs, tasks and citations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Low-confidence ontology match; candidates are surfaced, never guessed.
    ClassificationAmbiguous,
    /// No retrieval results for a criterion; the rating is capped.
    EvidenceAbsent,
    /// A single call or task exceeded its own time box.
    TaskTimeout,
    /// The job-level deadline fired.
    JobDeadlineExceeded,
    /// Transport failure from the model or a knowledge source.
    ProviderError,
    /// The authoritative source could not be reached for a citation.
    VerificationUnavailable,
    /// Programming or contract violation.
    InternalFault,
    /// Model output failed schema validation twice.
    MalformedOutput,
    /// Every evaluation task failed before the deadline.
    NoVerdicts,
    /// Work was abandoned because the job was cancelled.
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ClassificationAmbiguous => "classification_ambiguous",
            ErrorCode::EvidenceAbsent => "evidence_absent",
            ErrorCode::TaskTimeout => "task_timeout",
            ErrorCode::JobDeadlineExceeded => "job_deadline_exceeded",
            ErrorCode::ProviderError => "provider_error",
            ErrorCode::VerificationUnavailable => "verification_unavailable",
            ErrorCode::InternalFault => "internal_fault",
            ErrorCode::MalformedOutput => "malformed_output",
            ErrorCode::NoVerdicts => "no_verdicts",
            ErrorCode::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ReviewError>;
