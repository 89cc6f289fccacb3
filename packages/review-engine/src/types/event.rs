//! Progress events emitted by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::job::JobState;
use super::ontology::CriterionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Complete,
    Error,
    Cancelled,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventKind::Progress)
    }

    /// Terminal event kind for a terminal job state.
    pub fn for_terminal_state(state: JobState) -> Option<EventKind> {
        match state {
            JobState::Complete => Some(EventKind::Complete),
            JobState::Error => Some(EventKind::Error),
            JobState::Cancelled => Some(EventKind::Cancelled),
            _ => None,
        }
    }
}

/// One `{stage, criterion?, message}` tuple in a job's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,

    /// Position in the job's stream, starting at 0, gap-free at the source.
    pub sequence: u64,
    pub stage: JobState,
    pub kind: EventKind,
    #[serde(default)]
    pub criterion: Option<CriterionId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
