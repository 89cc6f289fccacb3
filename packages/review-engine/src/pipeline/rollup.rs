//! Rolls per-criterion ratings up into one overall rating.

use std::collections::HashMap;

use crate::types::config::RollupPolicy;
use crate::types::ontology::{Criterion, CriterionId, Priority};
use crate::types::verdict::{Rating, Verdict};

/// Compute the overall rating.
///
/// `total` is the number of criteria in the job, including ones that failed
/// to produce a verdict, so missing verdicts dilute neither threshold.
///
/// - red if any high-priority criterion is red, or more than
///   `red_fraction` of criteria are red;
/// - amber if any criterion is red or more than `amber_fraction` are amber;
/// - green otherwise.
pub fn rollup(
    criteria: &[Criterion],
    verdicts: &[Verdict],
    total: usize,
    policy: &RollupPolicy,
) -> Rating {
    let priorities: HashMap<&CriterionId, Priority> =
        criteria.iter().map(|c| (&c.id, c.priority)).collect();
    let total = total.max(verdicts.len());

    let mut red = 0;
    let mut amber = 0;
    let mut high_red = false;
    for verdict in verdicts {
        match verdict.rating {
            Rating::Red => {
                red += 1;
                if priorities.get(&verdict.criterion_id) == Some(&Priority::High) {
                    high_red = true;
                }
            }
            Rating::Amber => amber += 1,
            Rating::Green => {}
        }
    }

    if high_red || policy.red_fraction.exceeded_by(red, total) {
        Rating::Red
    } else if red > 0 || policy.amber_fraction.exceeded_by(amber, total) {
        Rating::Amber
    } else {
        Rating::Green
    }
}
