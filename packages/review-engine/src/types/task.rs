//! Evaluation tasks: one per criterion (or sub-question) in a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::citation::Citation;
use super::ontology::CriterionId;
use super::verdict::Verdict;
use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }
}

/// Machine-readable reason a task did not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One unit of evaluation work and its outcome.
///
/// Owned by exactly one party at a time: the orchestrator while pending,
/// the spawned unit while running, the orchestrator again at the barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTask {
    pub criterion_id: CriterionId,
    pub attempts: u32,
    pub status: TaskStatus,
    pub verdict: Option<Verdict>,

    /// Citations proposed with the verdict, before verification.
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub failure: Option<TaskFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EvaluationTask {
    pub fn new(criterion_id: impl Into<CriterionId>) -> Self {
        Self {
            criterion_id: criterion_id.into(),
            attempts: 0,
            status: TaskStatus::Pending,
            verdict: None,
            citations: Vec::new(),
            failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, verdict: Verdict, citations: Vec<Citation>) {
        self.status = TaskStatus::Succeeded;
        self.verdict = Some(verdict);
        self.citations = citations;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, failure: TaskFailure) {
        self.status = if matches!(
            failure.code,
            ErrorCode::TaskTimeout | ErrorCode::JobDeadlineExceeded
        ) && self.status == TaskStatus::Running
        {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        self.failure = Some(failure);
        self.finished_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
