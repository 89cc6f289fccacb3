//! Review jobs and their state machine.
//!
//! ```text
//! Pending → Identifying → Processing → VerifyingCitations → Complete
//!    │           │             │                │
//!    └───────────┴─────────────┴────────────────┴──→ Cancelled
//!    (any non-terminal state) ─────────────────────→ Error
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::ids::{JobId, RequesterId, TenantId};
use super::ontology::Criterion;
use super::result::ReviewResult;
use super::task::EvaluationTask;
use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Identifying,
    Processing,
    VerifyingCitations,
    Complete,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error | JobState::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Complete | Error | Cancelled, _) => false,
            (_, Error) | (_, Cancelled) => true,
            (Pending, Identifying)
            | (Identifying, Processing)
            | (Processing, VerifyingCitations)
            | (VerifyingCitations, Complete) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Identifying => "identifying",
            JobState::Processing => "processing",
            JobState::VerifyingCitations => "verifying_citations",
            JobState::Complete => "complete",
            JobState::Error => "error",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is being reviewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewInput {
    /// A policy document, already extracted to text.
    Document { title: String, text: String },
    /// A free-form compliance question.
    Question { text: String },
}

impl ReviewInput {
    pub fn document(title: impl Into<String>, text: impl Into<String>) -> Self {
        ReviewInput::Document {
            title: title.into(),
            text: text.into(),
        }
    }

    pub fn question(text: impl Into<String>) -> Self {
        ReviewInput::Question { text: text.into() }
    }

    /// The source text handed to every evaluation unit.
    pub fn text(&self) -> &str {
        match self {
            ReviewInput::Document { text, .. } => text,
            ReviewInput::Question { text } => text,
        }
    }

    pub fn is_question(&self) -> bool {
        matches!(self, ReviewInput::Question { .. })
    }
}

/// Caller's request to start a review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub tenant_id: TenantId,
    pub requester_id: RequesterId,
    pub input: ReviewInput,

    /// Wall-clock budget from start to terminal event. `None` uses the
    /// configured default.
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Ontology entry the caller confirmed after an ambiguous
    /// classification. Skips the classification call.
    #[serde(default)]
    pub confirmed_target: Option<String>,
}

impl ReviewRequest {
    pub fn new(tenant_id: TenantId, requester_id: RequesterId, input: ReviewInput) -> Self {
        Self {
            tenant_id,
            requester_id,
            input,
            deadline_ms: None,
            confirmed_target: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn with_confirmed_target(mut self, entry_id: impl Into<String>) -> Self {
        self.confirmed_target = Some(entry_id.into());
        self
    }
}

/// Ontology entry the input was matched to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMatch {
    pub entry_id: String,
    pub name: String,
    pub confidence: f64,
}

/// A classification candidate surfaced when the match is ambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub entry_id: String,
    pub name: String,
    pub confidence: f64,
}

/// Job-level failure, renderable without reading logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,

    /// Top candidates for `ClassificationAmbiguous`.
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            candidates: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.candidates = candidates;
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A review job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub requester_id: RequesterId,
    pub input: ReviewInput,
    pub target: Option<TargetMatch>,

    /// Criteria loaded at job start (or derived from the question).
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    pub state: JobState,
    pub deadline_ms: u64,
    #[serde(default)]
    pub tasks: Vec<EvaluationTask>,
    pub result: Option<ReviewResult>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReviewJob {
    pub fn new(request: &ReviewRequest, deadline_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id: request.tenant_id,
            requester_id: request.requester_id,
            input: request.input.clone(),
            target: None,
            criteria: Vec::new(),
            state: JobState::Pending,
            deadline_ms,
            tasks: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Summary row for listings.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            tenant_id: self.tenant_id,
            requester_id: self.requester_id,
            state: self.state,
            target_id: self.target.as_ref().map(|t| t.entry_id.clone()),
            overall: self.result.as_ref().map(|r| r.overall),
            error_code: self.error.as_ref().map(|e| e.code),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// What `get_result` reports for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultStatus {
    /// The job is `Complete`.
    Ready(Box<ReviewResult>),
    /// The job is still running, in the given state.
    Pending(JobState),
    /// The job ended in `Error`.
    Failed(JobError),
    /// The job was cancelled.
    Cancelled,
}

/// Listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub requester_id: RequesterId,
    pub state: JobState,
    pub target_id: Option<String>,
    pub overall: Option<super::verdict::Rating>,
    pub error_code: Option<ErrorCode>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub requester_id: Option<RequesterId>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &ReviewJob) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        }
        if let Some(target) = &self.target_id {
            if job.target.as_ref().map(|t| &t.entry_id) != Some(target) {
                return false;
            }
        }
        if let Some(requester) = self.requester_id {
            if job.requester_id != requester {
                return false;
            }
        }
        true
    }
}
