//! Comparisons and aggregates over completed results.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ReviewError};
use crate::types::ids::JobId;
use crate::types::ontology::CriterionId;
use crate::types::result::ReviewResult;
use crate::types::verdict::Rating;

/// Direction of a rating change between two results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Improved,
    Unchanged,
    Regressed,
    /// Only one of the two results has a verdict for the criterion.
    Missing,
}

impl Change {
    fn between(before: Option<Rating>, after: Option<Rating>) -> Self {
        match (before, after) {
            (Some(b), Some(a)) if a < b => Change::Improved,
            (Some(b), Some(a)) if a > b => Change::Regressed,
            (Some(_), Some(_)) => Change::Unchanged,
            _ => Change::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionDelta {
    pub criterion_id: CriterionId,
    pub before: Option<Rating>,
    pub after: Option<Rating>,
    pub change: Change,
}

/// Per-criterion differences between an earlier and a later result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultComparison {
    pub before: JobId,
    pub after: JobId,
    pub target_id: String,
    pub overall_before: Rating,
    pub overall_after: Rating,
    pub overall_change: Change,
    pub criteria: Vec<CriterionDelta>,
}

impl ResultComparison {
    pub fn changed(&self) -> impl Iterator<Item = &CriterionDelta> {
        self.criteria
            .iter()
            .filter(|d| d.change != Change::Unchanged)
    }
}

/// Compare two results of the same ontology entry.
pub fn compare_results(before: &ReviewResult, after: &ReviewResult) -> Result<ResultComparison> {
    if before.target.entry_id != after.target.entry_id {
        return Err(ReviewError::InvalidRequest {
            reason: format!(
                "cannot compare results for different targets ({} vs {})",
                before.target.entry_id, after.target.entry_id
            ),
        });
    }

    let mut ids: Vec<&CriterionId> = before.verdicts.iter().map(|v| &v.criterion_id).collect();
    for verdict in &after.verdicts {
        if !ids.contains(&&verdict.criterion_id) {
            ids.push(&verdict.criterion_id);
        }
    }

    let criteria = ids
        .into_iter()
        .map(|id| {
            let b = before.verdict(id).map(|v| v.rating);
            let a = after.verdict(id).map(|v| v.rating);
            CriterionDelta {
                criterion_id: id.clone(),
                before: b,
                after: a,
                change: Change::between(b, a),
            }
        })
        .collect();

    Ok(ResultComparison {
        before: before.job_id,
        after: after.job_id,
        target_id: before.target.entry_id.clone(),
        overall_before: before.overall,
        overall_after: after.overall,
        overall_change: Change::between(Some(before.overall), Some(after.overall)),
        criteria,
    })
}

/// Counts of overall ratings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingDistribution {
    pub green: usize,
    pub amber: usize,
    pub red: usize,
}

impl RatingDistribution {
    pub fn total(&self) -> usize {
        self.green + self.amber + self.red
    }
}

/// Distribution of overall ratings across results.
pub fn rating_distribution<'a>(results: impl IntoIterator<Item = &'a ReviewResult>) -> RatingDistribution {
    let mut distribution = RatingDistribution::default();
    for result in results {
        match result.overall {
            Rating::Green => distribution.green += 1,
            Rating::Amber => distribution.amber += 1,
            Rating::Red => distribution.red += 1,
        }
    }
    distribution
}
