//! Result assembly.
//!
//! A pure function from verified verdicts to a [`ReviewResult`]: justification
//! softening, rollup, gap analysis, action deduplication and the confidence
//! tier. Runs only after every citation has a terminal status.

use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;

use super::rollup::rollup;
use crate::error::{Result, ReviewError};
use crate::types::citation::{Citation, VerificationStatus, VerificationSummary};
use crate::types::config::ReviewConfig;
use crate::types::ids::JobId;
use crate::types::job::TargetMatch;
use crate::types::ontology::{Criterion, OntologyEntry, Severity, StructuralElement};
use crate::types::result::{Action, Confidence, FailedCriterion, Gap, GapKind, ReviewResult};
use crate::types::verdict::{Rating, Verdict};

/// Everything the assembler needs.
#[derive(Debug, Clone)]
pub struct AssemblyInput<'a> {
    pub job_id: JobId,
    pub target: &'a TargetMatch,
    pub criteria: &'a [Criterion],
    pub verdicts: Vec<Verdict>,
    pub failed: Vec<FailedCriterion>,
    pub citations: Vec<Citation>,
    pub missing_elements: Vec<StructuralElement>,
    pub config: &'a ReviewConfig,
}

/// Required structural elements absent from a document.
pub fn missing_elements(entry: &OntologyEntry, document: &str) -> Vec<StructuralElement> {
    entry
        .required_elements
        .iter()
        .filter(|e| !e.is_present_in(document))
        .cloned()
        .collect()
}

/// Build the final result.
pub fn assemble(input: AssemblyInput<'_>) -> Result<ReviewResult> {
    if let Some(c) = input
        .citations
        .iter()
        .find(|c| c.status == VerificationStatus::Unverified)
    {
        return Err(ReviewError::Internal(format!(
            "citation {} for criterion {} reached assembly unverified",
            c.id, c.criterion_id
        )));
    }

    let order: HashMap<&str, usize> = input
        .criteria
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();
    for verdict in &input.verdicts {
        if !order.contains_key(verdict.criterion_id.as_str()) {
            return Err(ReviewError::Internal(format!(
                "verdict for unknown criterion {}",
                verdict.criterion_id
            )));
        }
    }

    let mut verdicts = input.verdicts;
    verdicts.sort_by_key(|v| order[v.criterion_id.as_str()]);
    for verdict in &mut verdicts {
        soften(verdict, &input.citations);
    }

    let overall = rollup(
        input.criteria,
        &verdicts,
        input.criteria.len(),
        &input.config.rollup,
    );
    let verification = VerificationSummary::from_citations(&input.citations);
    let confidence = confidence(&verdicts, &input.failed, &verification, input.config);
    let gaps = gaps(input.criteria, &verdicts, &input.failed, &input.missing_elements);
    let actions = actions(input.criteria, &verdicts);

    Ok(ReviewResult {
        job_id: input.job_id,
        target: input.target.clone(),
        overall,
        confidence,
        verdicts,
        failed: input.failed,
        gaps,
        actions,
        citations: input.citations,
        verification,
        assembled_at: Utc::now(),
    })
}

/// Rewrite the justification of a verdict whose citations did not all
/// verify, and cap a green verdict left without supporting citations.
fn soften(verdict: &mut Verdict, citations: &[Citation]) {
    let own: Vec<&Citation> = citations
        .iter()
        .filter(|c| verdict.citations.contains(&c.id))
        .collect();
    let removed = own
        .iter()
        .filter(|c| c.status == VerificationStatus::Removed)
        .count();
    let digitised = own
        .iter()
        .filter(|c| c.status == VerificationStatus::DigitisedUnverifiable)
        .count();
    let surviving = own
        .iter()
        .filter(|c| {
            matches!(
                c.status,
                VerificationStatus::Verified | VerificationStatus::DigitisedUnverifiable
            )
        })
        .count();

    if removed > 0 {
        verdict.justification = format!(
            "This assessment is uncertain: {} of {} supporting citation(s) could not be \
             verified and were removed. {}",
            removed,
            own.len(),
            verdict.justification
        );
    }
    if digitised > 0 {
        verdict.justification.push_str(&format!(
            " Note: {} citation(s) refer to digitised sources that cannot be verified \
             against a machine-readable original.",
            digitised
        ));
    }
    if surviving == 0 && verdict.rating == Rating::Green {
        verdict.rating = verdict.rating.no_better_than(Rating::Amber);
        verdict.capped = true;
        verdict.justification.push_str(
            " Rated amber: no supporting citation survived verification.",
        );
    }
}

fn confidence(
    verdicts: &[Verdict],
    failed: &[FailedCriterion],
    verification: &VerificationSummary,
    config: &ReviewConfig,
) -> Confidence {
    if !failed.is_empty() || verification.removed_fraction() > config.removed_citation_fraction {
        Confidence::Low
    } else if verification.removed > 0 || verdicts.iter().any(|v| v.capped) {
        Confidence::Medium
    } else {
        Confidence::High
    }
}

fn gaps(
    criteria: &[Criterion],
    verdicts: &[Verdict],
    failed: &[FailedCriterion],
    missing: &[StructuralElement],
) -> Vec<Gap> {
    let by_id: HashMap<&str, &Criterion> = criteria.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut gaps = Vec::new();

    for element in missing {
        gaps.push(Gap {
            kind: GapKind::MissingElement,
            subject: element.name.clone(),
            severity: element.priority.severity(),
            detail: format!("required element \"{}\" not found in the document", element.name),
        });
    }

    for verdict in verdicts {
        let Some(criterion) = by_id.get(verdict.criterion_id.as_str()) else {
            continue;
        };
        let severity = criterion.priority.severity();
        if verdict.rating != Rating::Green {
            gaps.push(Gap {
                kind: GapKind::NonGreen {
                    rating: verdict.rating,
                },
                subject: criterion.id.clone(),
                severity,
                detail: format!("{} rated {}: {}", criterion.name, verdict.rating, verdict.justification),
            });
        }
        if verdict.capped && !verdict.evidence.has_evidence_of(criterion.required_evidence) {
            gaps.push(Gap {
                kind: GapKind::NoEvidence,
                subject: criterion.id.clone(),
                severity,
                detail: format!(
                    "no evidence found: no {} excerpts were retrieved for {}",
                    criterion.required_evidence, criterion.name
                ),
            });
        }
    }

    for failure in failed {
        let severity = by_id
            .get(failure.criterion_id.as_str())
            .map(|c| c.priority.severity())
            .unwrap_or(Severity::Important);
        gaps.push(Gap {
            kind: GapKind::NotEvaluated,
            subject: failure.criterion_id.clone(),
            severity,
            detail: format!(
                "no evidence found: criterion not evaluated ({}: {})",
                failure.failure.code, failure.failure.message
            ),
        });
    }

    gaps.sort_by_key(|g| g.severity);
    gaps
}

fn actions(criteria: &[Criterion], verdicts: &[Verdict]) -> Vec<Action> {
    let by_id: HashMap<&str, &Criterion> = criteria.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut by_area: IndexMap<String, Action> = IndexMap::new();

    for verdict in verdicts.iter().filter(|v| v.rating != Rating::Green) {
        let Some(criterion) = by_id.get(verdict.criterion_id.as_str()) else {
            continue;
        };
        let description = if verdict.remediations.is_empty() {
            format!("Address \"{}\" (rated {})", criterion.name, verdict.rating)
        } else {
            verdict.remediations.join("; ")
        };
        let severity = criterion.priority.severity();

        by_area
            .entry(criterion.area().to_string())
            .and_modify(|action| {
                action.severity = action.severity.min(severity);
                if !action.description.contains(&description) {
                    action.description.push_str("; ");
                    action.description.push_str(&description);
                }
                action.criteria.push(criterion.id.clone());
            })
            .or_insert_with(|| Action {
                target_area: criterion.area().to_string(),
                severity,
                description,
                criteria: vec![criterion.id.clone()],
            });
    }

    let mut actions: Vec<Action> = by_area.into_values().collect();
    actions.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.target_area.cmp(&b.target_area))
    });
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::evidence::{
        EvidenceSummary, Locator, SourceKind, SourceOutcome, SourceReport,
    };
    use crate::types::ontology::Priority;
    use crate::types::task::TaskFailure;

    fn target() -> TargetMatch {
        TargetMatch {
            entry_id: "privacy".into(),
            name: "Privacy policy".into(),
            confidence: 0.9,
        }
    }

    fn verdict(id: &str, rating: Rating, citations: &[&Citation]) -> Verdict {
        Verdict {
            criterion_id: id.into(),
            rating,
            justification: "Covered in section 4.".into(),
            citations: citations.iter().map(|c| c.id).collect(),
            remediations: vec![],
            evidence: EvidenceSummary {
                reports: vec![SourceReport {
                    source: "docs".into(),
                    kind: SourceKind::TenantDocument,
                    outcome: SourceOutcome::Found { count: 2 },
                }],
                context_excerpts: 2,
            },
            capped: false,
        }
    }

    fn citation(id: &str, status: VerificationStatus) -> Citation {
        let mut c = Citation::new(id, Locator::new(SourceKind::Legislation, "GDPR"), "text");
        c.resolve(status, None);
        c
    }

    /// A green verdict backed by one verified citation.
    fn green(id: &str) -> (Verdict, Citation) {
        let ok = citation(id, VerificationStatus::Verified);
        (verdict(id, Rating::Green, &[&ok]), ok)
    }

    fn criteria() -> Vec<Criterion> {
        vec![
            Criterion::new("a", "Lawful basis").with_priority(Priority::High),
            Criterion::new("b", "Retention").with_target_area("records"),
            Criterion::new("c", "Disposal")
                .with_priority(Priority::Low)
                .with_target_area("records"),
        ]
    }

    #[test]
    fn test_unverified_citation_fails_assembly() {
        let criteria = criteria();
        let pending = Citation::new("a", Locator::new(SourceKind::Legislation, "GDPR"), "t");
        let config = ReviewConfig::default();
        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![verdict("a", Rating::Green, &[&pending])],
            failed: vec![],
            citations: vec![pending],
            missing_elements: vec![],
            config: &config,
        });
        assert!(matches!(result, Err(ReviewError::Internal(_))));
    }

    #[test]
    fn test_removed_citation_softens_justification() {
        let criteria = criteria();
        let ok = citation("a", VerificationStatus::Verified);
        let gone = citation("a", VerificationStatus::Removed);
        let config = ReviewConfig::default();
        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![verdict("a", Rating::Green, &[&ok, &gone])],
            failed: vec![],
            citations: vec![ok, gone],
            missing_elements: vec![],
            config: &config,
        })
        .unwrap();

        let a = result.verdict("a").unwrap();
        assert!(a.justification.starts_with("This assessment is uncertain: 1 of 2"));
        assert!(a.justification.ends_with("Covered in section 4."));
        // 1 of 2 removed is above the 0.25 threshold.
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[test]
    fn test_green_without_surviving_citations_is_capped_to_amber() {
        let criteria = criteria();
        let gone = citation("a", VerificationStatus::Removed);
        let (b, b_citation) = green("b");
        let config = ReviewConfig::default();
        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![verdict("a", Rating::Green, &[&gone]), b],
            failed: vec![],
            citations: vec![gone, b_citation],
            missing_elements: vec![],
            config: &config,
        })
        .unwrap();

        let a = result.verdict("a").unwrap();
        assert_eq!(a.rating, Rating::Amber);
        assert!(a.capped);
        assert!(a.justification.contains("no supporting citation survived verification"));
        assert_eq!(result.verdict("b").unwrap().rating, Rating::Green);
        assert!(result.gaps_for("a").any(|g| matches!(g.kind, GapKind::NonGreen { .. })));
    }

    #[test]
    fn test_actions_deduplicate_by_area() {
        let criteria = criteria();
        let mut b = verdict("b", Rating::Amber, &[]);
        b.remediations = vec!["Publish a retention schedule".into()];
        let c = verdict("c", Rating::Red, &[]);
        let (a, a_citation) = green("a");
        let config = ReviewConfig::default();

        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![c, b, a],
            failed: vec![],
            citations: vec![a_citation],
            missing_elements: vec![],
            config: &config,
        })
        .unwrap();

        assert_eq!(result.actions.len(), 1);
        let action = &result.actions[0];
        assert_eq!(action.target_area, "records");
        assert_eq!(action.severity, Severity::Important);
        assert_eq!(action.criteria, vec!["b".to_string(), "c".to_string()]);
        assert!(action.description.contains("Publish a retention schedule"));
        assert!(action.description.contains("Disposal"));
        // Verdicts come back in criterion order.
        let ids: Vec<_> = result.verdicts.iter().map(|v| v.criterion_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_gaps_cover_elements_capped_and_failed() {
        let criteria = criteria();
        let mut capped = verdict("b", Rating::Amber, &[]);
        capped.capped = true;
        capped.evidence = EvidenceSummary::default();
        let entry = OntologyEntry::new("privacy", "Privacy policy")
            .with_element(StructuralElement::new("Contact details", Priority::High));
        let (a, a_citation) = green("a");
        let config = ReviewConfig::default();

        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![a, capped],
            failed: vec![FailedCriterion {
                criterion_id: "c".into(),
                failure: TaskFailure::new(ErrorCode::TaskTimeout, "slow model"),
            }],
            citations: vec![a_citation],
            missing_elements: missing_elements(&entry, "We process data lawfully."),
            config: &config,
        })
        .unwrap();

        assert_eq!(result.gaps[0].kind, GapKind::MissingElement);
        assert_eq!(result.gaps[0].severity, Severity::Critical);
        assert!(result
            .gaps_for("b")
            .any(|g| g.kind == GapKind::NoEvidence && g.detail.starts_with("no evidence found")));
        assert!(result.gaps_for("c").any(|g| g.kind == GapKind::NotEvaluated));
        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.overall, Rating::Green);
    }

    #[test]
    fn test_capped_verdict_is_medium_confidence() {
        let criteria = criteria();
        let mut b = verdict("b", Rating::Amber, &[]);
        b.capped = true;
        let (a, a_citation) = green("a");
        let (c, c_citation) = green("c");
        let config = ReviewConfig::default();
        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![a, b, c],
            failed: vec![],
            citations: vec![a_citation, c_citation],
            missing_elements: vec![],
            config: &config,
        })
        .unwrap();
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[test]
    fn test_digitised_citation_is_noted() {
        let criteria = criteria();
        let old = citation("a", VerificationStatus::DigitisedUnverifiable);
        let config = ReviewConfig::default();
        let result = assemble(AssemblyInput {
            job_id: JobId::new(),
            target: &target(),
            criteria: &criteria,
            verdicts: vec![verdict("a", Rating::Green, &[&old])],
            failed: vec![],
            citations: vec![old],
            missing_elements: vec![],
            config: &config,
        })
        .unwrap();
        assert!(result.verdict("a").unwrap().justification.contains("digitised"));
        assert_eq!(result.verification.digitised_unverifiable, 1);
    }
}
