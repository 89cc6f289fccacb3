//! Evaluation unit: one criterion in, one validated verdict (or a recorded
//! failure) out.
//!
//! 1. Query every knowledge source in parallel, each call time-boxed and
//!    allowed to fail on its own.
//! 2. Build a bounded context, best excerpts first, interleaved across
//!    sources.
//! 3. Ask the model for a [`StructuredVerdict`] and validate it.
//! 4. Apply the citation and evidence caps.

use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::guard::guarded;
use super::parse::{parse_verdict, Parsed};
use super::prompts::{format_evaluate_prompt, SYSTEM_PROMPT};
use crate::error::{ErrorCode, ReviewError};
use crate::traits::knowledge::{KnowledgeSource, SearchQuery};
use crate::traits::model::{CompletionRequest, LanguageModel};
use crate::types::citation::Citation;
use crate::types::config::ReviewConfig;
use crate::types::evidence::{EvidenceSummary, Excerpt, SourceOutcome, SourceReport};
use crate::types::ids::TenantId;
use crate::types::ontology::Criterion;
use crate::types::task::TaskFailure;
use crate::types::verdict::{Rating, StructuredVerdict, Verdict};

/// A successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Unverified citations proposed with the verdict.
    pub citations: Vec<Citation>,
}

/// Outcome of one run of the unit, with the number of model calls made.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub attempts: u32,
    pub outcome: Result<Evaluation, TaskFailure>,
}

impl TaskRun {
    fn failed(attempts: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            attempts,
            outcome: Err(TaskFailure::new(code, message)),
        }
    }
}

/// Retrieved excerpts plus per-source bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub per_source: Vec<Vec<Excerpt>>,
    pub evidence: EvidenceSummary,
}

/// Evaluates criteria against a source text.
///
/// Cheap to clone; each spawned task takes its own copy.
#[derive(Clone)]
pub struct EvaluationUnit {
    model: Arc<dyn LanguageModel>,
    sources: Arc<Vec<Arc<dyn KnowledgeSource>>>,
    config: Arc<ReviewConfig>,
}

impl EvaluationUnit {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        sources: Arc<Vec<Arc<dyn KnowledgeSource>>>,
        config: Arc<ReviewConfig>,
    ) -> Self {
        Self {
            model,
            sources,
            config,
        }
    }

    /// Evaluate one criterion.
    #[instrument(skip_all, fields(criterion = %criterion.id))]
    pub async fn evaluate(
        &self,
        tenant_id: TenantId,
        criterion: &Criterion,
        source_text: &str,
        cancel: &CancellationToken,
    ) -> TaskRun {
        let retrieval = self.retrieve(tenant_id, criterion, cancel).await;
        if cancel.is_cancelled() {
            return TaskRun::failed(0, ErrorCode::Cancelled, "job cancelled during retrieval");
        }

        let context = build_context(
            &retrieval.per_source,
            self.config.max_context_excerpts,
            self.config.max_context_chars,
        );
        let mut evidence = retrieval.evidence;
        evidence.context_excerpts = context.len();
        let notes = evidence_notes(&evidence);

        debug!(
            excerpts = context.len(),
            empty = evidence.empty_sources().len(),
            failed = evidence.failed_sources().len(),
            "context assembled"
        );

        let mut attempts = 0;
        let mut strict = false;
        let mut provider_retried = false;
        let structured = loop {
            attempts += 1;
            let request = CompletionRequest::for_type::<StructuredVerdict>(
                "structured_verdict",
                SYSTEM_PROMPT,
                format_evaluate_prompt(criterion, source_text, &context, &notes, strict),
            );

            let raw = match guarded(
                cancel,
                self.config.llm_timeout(),
                "evaluation",
                self.model.complete(&request),
            )
            .await
            {
                Ok(raw) => raw,
                Err(ReviewError::Cancelled) => {
                    return TaskRun::failed(attempts, ErrorCode::Cancelled, "job cancelled");
                }
                Err(e) if e.is_retryable() && !provider_retried => {
                    warn!(error = %e, "model call failed, retrying once");
                    provider_retried = true;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "model call failed");
                    return TaskRun::failed(attempts, e.code(), e.to_string());
                }
            };

            match parse_verdict(&raw) {
                Parsed::Ok(verdict) => break verdict,
                Parsed::Malformed { reason, .. } if !strict => {
                    warn!(reason = %reason, "malformed verdict, retrying with strict instruction");
                    strict = true;
                }
                Parsed::Malformed { reason, .. } => {
                    warn!(reason = %reason, "malformed verdict after strict retry");
                    return TaskRun::failed(
                        attempts,
                        ErrorCode::MalformedOutput,
                        format!("model output failed validation twice: {reason}"),
                    );
                }
            }
        };

        let (verdict, citations) = apply_rules(criterion, structured, evidence);
        debug!(rating = %verdict.rating, capped = verdict.capped, citations = citations.len(), "verdict ready");

        TaskRun {
            attempts,
            outcome: Ok(Evaluation { verdict, citations }),
        }
    }

    /// Query every source in parallel. Never fails: each source's outcome is
    /// recorded in the evidence summary.
    ///
    /// A transport failure is retried once within the same per-call timeout.
    pub async fn retrieve(
        &self,
        tenant_id: TenantId,
        criterion: &Criterion,
        cancel: &CancellationToken,
    ) -> Retrieval {
        let query =
            SearchQuery::new(criterion.search_text(), tenant_id).with_limit(self.config.search_limit);
        let timeout = self.config.search_timeout();

        let calls = self.sources.iter().map(|source| {
            let query = &query;
            async move {
                let search = async {
                    match source.search(query).await {
                        Err(e) if e.is_retryable() => {
                            debug!(source = source.name(), error = %e, "search failed, retrying once");
                            source.search(query).await
                        }
                        outcome => outcome,
                    }
                };
                let outcome = guarded(cancel, timeout, "search", search).await;
                (source, outcome)
            }
        });

        let mut retrieval = Retrieval::default();
        for (source, outcome) in join_all(calls).await {
            let (excerpts, outcome) = match outcome {
                Ok(excerpts) if excerpts.is_empty() => (excerpts, SourceOutcome::Empty),
                Ok(excerpts) => {
                    let count = excerpts.len();
                    (excerpts, SourceOutcome::Found { count })
                }
                Err(ReviewError::Cancelled) => (Vec::new(), SourceOutcome::Skipped),
                Err(e) => {
                    warn!(source = source.name(), error = %e, "knowledge source failed");
                    (
                        Vec::new(),
                        SourceOutcome::Failed {
                            message: format!("{}: {}", e.code(), e),
                        },
                    )
                }
            };
            retrieval.evidence.reports.push(SourceReport {
                source: source.name().to_string(),
                kind: source.kind(),
                outcome,
            });
            retrieval.per_source.push(excerpts);
        }
        retrieval
    }
}

/// Interleave excerpts across sources, best first, within the budget.
///
/// Excerpts that would overflow `max_chars` are skipped; a smaller one later
/// in the rotation may still fit.
pub fn build_context(per_source: &[Vec<Excerpt>], max_excerpts: usize, max_chars: usize) -> Vec<Excerpt> {
    let ranked: Vec<Vec<&Excerpt>> = per_source
        .iter()
        .map(|excerpts| {
            let mut sorted: Vec<&Excerpt> = excerpts.iter().collect();
            sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
            sorted
        })
        .collect();

    let mut context = Vec::new();
    let mut chars = 0;
    let mut round = 0;
    while context.len() < max_excerpts && ranked.iter().any(|r| round < r.len()) {
        for source in ranked.iter() {
            let Some(excerpt) = source.get(round) else {
                continue;
            };
            if context.len() >= max_excerpts {
                break;
            }
            let len = excerpt.text.chars().count();
            if chars + len <= max_chars {
                chars += len;
                context.push((*excerpt).clone());
            }
        }
        round += 1;
    }
    context
}

/// Notes for sources that returned nothing or failed.
fn evidence_notes(evidence: &EvidenceSummary) -> Vec<String> {
    evidence
        .reports
        .iter()
        .filter_map(|r| match &r.outcome {
            SourceOutcome::Empty => Some(format!("{} ({}): no evidence found", r.source, r.kind)),
            SourceOutcome::Failed { .. } => Some(format!("{} ({}): unavailable", r.source, r.kind)),
            _ => None,
        })
        .collect()
}

/// Turn a validated model answer into a verdict.
///
/// - a green verdict without citations is lowered to amber;
/// - without excerpts of the required evidence kind the rating is capped at
///   amber;
/// - sources that came back empty are named in the justification.
pub fn apply_rules(
    criterion: &Criterion,
    structured: StructuredVerdict,
    evidence: EvidenceSummary,
) -> (Verdict, Vec<Citation>) {
    let mut rating = structured.rating;
    let mut justification = structured.justification.trim().to_string();
    let mut capped = false;

    if rating == Rating::Green && structured.citations.is_empty() {
        rating = Rating::Amber;
        capped = true;
        justification.push_str(" No supporting citations were given, so the rating cannot be green.");
    }

    if !evidence.has_evidence_of(criterion.required_evidence) {
        rating = rating.no_better_than(Rating::Amber);
        capped = true;
        justification.push_str(&format!(
            " Evidence absent: no {} excerpts were found, so the rating is capped at amber.",
            criterion.required_evidence
        ));
    }

    let empty = evidence.empty_sources();
    if !empty.is_empty() {
        justification.push_str(&format!(" No evidence found in: {}.", empty.join(", ")));
    }

    let citations: Vec<Citation> = structured
        .citations
        .into_iter()
        .map(|c| Citation::new(criterion.id.clone(), c.locator, c.quote))
        .collect();

    let verdict = Verdict {
        criterion_id: criterion.id.clone(),
        rating,
        justification,
        citations: citations.iter().map(|c| c.id).collect(),
        remediations: structured.remediations,
        evidence,
        capped,
    };
    (verdict, citations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockKnowledgeSource, MockModel};
    use crate::types::evidence::{Locator, SourceKind};
    use crate::types::verdict::ProposedCitation;

    fn excerpt(kind: SourceKind, id: &str, text: &str, score: f32) -> Excerpt {
        Excerpt::new(Locator::new(kind, id), text).with_score(score)
    }

    fn evidence(found: &[(SourceKind, usize)]) -> EvidenceSummary {
        EvidenceSummary {
            reports: found
                .iter()
                .map(|(kind, count)| SourceReport {
                    source: kind.to_string(),
                    kind: *kind,
                    outcome: if *count == 0 {
                        SourceOutcome::Empty
                    } else {
                        SourceOutcome::Found { count: *count }
                    },
                })
                .collect(),
            context_excerpts: 0,
        }
    }

    fn green(citations: usize) -> StructuredVerdict {
        StructuredVerdict {
            rating: Rating::Green,
            justification: "Fully covered.".into(),
            citations: (0..citations)
                .map(|i| ProposedCitation {
                    locator: Locator::new(SourceKind::Legislation, format!("Act {i}")),
                    quote: "shall notify".into(),
                })
                .collect(),
            remediations: vec![],
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_retried_once() {
        let failing = Arc::new(
            MockKnowledgeSource::new("legislation", SourceKind::Legislation).failing("503"),
        );
        let library = Arc::new(
            MockKnowledgeSource::new("policy library", SourceKind::TenantDocument)
                .with_excerpt("policy.pdf", "We notify breaches within 72 hours."),
        );
        let sources: Vec<Arc<dyn KnowledgeSource>> = vec![
            failing.clone() as Arc<dyn KnowledgeSource>,
            library.clone() as Arc<dyn KnowledgeSource>,
        ];
        let unit = EvaluationUnit::new(
            Arc::new(MockModel::new()),
            Arc::new(sources),
            Arc::new(ReviewConfig::default()),
        );
        let criterion = Criterion::new("p2", "Breach notification");

        let retrieval = unit
            .retrieve(TenantId::new(), &criterion, &CancellationToken::new())
            .await;

        assert_eq!(failing.search_count(), 2);
        assert_eq!(library.search_count(), 1);
        assert!(matches!(
            retrieval.evidence.reports[0].outcome,
            SourceOutcome::Failed { .. }
        ));
        assert_eq!(retrieval.evidence.reports[1].outcome, SourceOutcome::Found { count: 1 });
    }

    #[test]
    fn test_context_interleaves_sources_best_first() {
        let per_source = vec![
            vec![
                excerpt(SourceKind::TenantDocument, "d1", "low", 0.1),
                excerpt(SourceKind::TenantDocument, "d2", "high", 0.9),
            ],
            vec![excerpt(SourceKind::Legislation, "l1", "law", 0.5)],
        ];
        let context = build_context(&per_source, 10, 1_000);
        let ids: Vec<_> = context.iter().map(|e| e.locator.identifier.as_str()).collect();
        assert_eq!(ids, vec!["d2", "l1", "d1"]);
    }

    #[test]
    fn test_context_respects_limits() {
        let per_source = vec![vec![
            excerpt(SourceKind::TenantDocument, "a", "aaaaa", 0.9),
            excerpt(SourceKind::TenantDocument, "b", "bbbbbbbbbb", 0.8),
            excerpt(SourceKind::TenantDocument, "c", "cc", 0.7),
        ]];
        let context = build_context(&per_source, 10, 8);
        let ids: Vec<_> = context.iter().map(|e| e.locator.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        assert_eq!(build_context(&per_source, 1, 1_000).len(), 1);
    }

    #[test]
    fn test_green_without_citations_is_amber() {
        let criterion = Criterion::new("c1", "Breach notification");
        let (verdict, citations) =
            apply_rules(&criterion, green(0), evidence(&[(SourceKind::TenantDocument, 2)]));
        assert_eq!(verdict.rating, Rating::Amber);
        assert!(verdict.capped);
        assert!(citations.is_empty());
        assert!(verdict.justification.contains("No supporting citations"));
    }

    #[test]
    fn test_missing_required_evidence_caps_at_amber() {
        let criterion = Criterion::new("c1", "Breach notification")
            .with_required_evidence(SourceKind::Legislation);
        let (verdict, citations) = apply_rules(
            &criterion,
            green(1),
            evidence(&[(SourceKind::TenantDocument, 3), (SourceKind::Legislation, 0)]),
        );
        assert_eq!(verdict.rating, Rating::Amber);
        assert!(verdict.capped);
        assert!(verdict.justification.contains("Evidence absent"));
        assert!(verdict.justification.contains("No evidence found in: legislation."));
        assert_eq!(citations.len(), 1);
        assert_eq!(verdict.citations, vec![citations[0].id]);
    }

    #[test]
    fn test_red_stays_red_when_capped() {
        let criterion = Criterion::new("c1", "Breach notification");
        let structured = StructuredVerdict {
            rating: Rating::Red,
            ..green(0)
        };
        let (verdict, _) = apply_rules(&criterion, structured, evidence(&[]));
        assert_eq!(verdict.rating, Rating::Red);
    }

    #[test]
    fn test_supported_green_is_kept() {
        let criterion = Criterion::new("c1", "Breach notification");
        let (verdict, citations) =
            apply_rules(&criterion, green(2), evidence(&[(SourceKind::TenantDocument, 2)]));
        assert_eq!(verdict.rating, Rating::Green);
        assert!(!verdict.capped);
        assert_eq!(verdict.justification, "Fully covered.");
        assert!(citations.iter().all(|c| c.criterion_id == "c1"));
    }
}
