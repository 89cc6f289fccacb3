//! The assembled review result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::citation::{Citation, VerificationSummary};
use super::ids::JobId;
use super::job::TargetMatch;
use super::ontology::{CriterionId, Severity};
use super::task::TaskFailure;
use super::verdict::{Rating, Verdict};

/// How much the caller should trust the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Why something appears in the gap list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GapKind {
    /// A required structural element is absent from the document.
    MissingElement,
    /// The criterion's verdict is amber or red.
    NonGreen { rating: Rating },
    /// No source returned evidence for the criterion.
    NoEvidence,
    /// The criterion could not be evaluated.
    NotEvaluated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    #[serde(flatten)]
    pub kind: GapKind,

    /// Element name or criterion id.
    pub subject: String,
    pub severity: Severity,
    pub detail: String,
}

/// A recommended remediation, deduplicated by target area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub target_area: String,
    pub severity: Severity,
    pub description: String,
    pub criteria: Vec<CriterionId>,
}

/// A criterion that produced no verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCriterion {
    pub criterion_id: CriterionId,
    pub failure: TaskFailure,
}

/// Final, fully-verified output of a review job.
///
/// Built once by the assembler and never partially visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub job_id: JobId,
    pub target: TargetMatch,
    pub overall: Rating,
    pub confidence: Confidence,
    pub verdicts: Vec<Verdict>,
    pub failed: Vec<FailedCriterion>,
    pub gaps: Vec<Gap>,
    pub actions: Vec<Action>,
    pub citations: Vec<Citation>,
    pub verification: VerificationSummary,
    pub assembled_at: DateTime<Utc>,
}

impl ReviewResult {
    pub fn verdict(&self, criterion_id: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.criterion_id == criterion_id)
    }

    pub fn citations_for<'a>(&'a self, criterion_id: &'a str) -> impl Iterator<Item = &'a Citation> {
        self.citations
            .iter()
            .filter(move |c| c.criterion_id == criterion_id)
    }

    pub fn gaps_for<'a>(&'a self, subject: &'a str) -> impl Iterator<Item = &'a Gap> {
        self.gaps.iter().filter(move |g| g.subject == subject)
    }
}
