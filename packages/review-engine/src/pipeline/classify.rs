//! Identifying stage: ontology classification and question decomposition.
//!
//! Classification is a single model call (plus one retry for malformed
//! output or a provider error) inside the stage sub-deadline. A match below
//! the confidence threshold is never resolved by guessing; the top
//! candidates are handed back for the caller to confirm.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::guard::guarded;
use super::parse::{parse_structured, Parsed};
use super::prompts::{format_classify_prompt, format_decompose_prompt, SYSTEM_PROMPT};
use crate::error::{Result, ReviewError};
use crate::traits::model::{CompletionRequest, LanguageModel};
use crate::types::config::ReviewConfig;
use crate::types::evidence::SourceKind;
use crate::types::job::{Candidate, TargetMatch};
use crate::types::ontology::{Criterion, Ontology, OntologyEntry, Priority};

/// Upper bound on sub-questions derived from one question.
pub const MAX_SUB_QUESTIONS: usize = 8;

/// Model output for classification.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassificationResponse {
    pub candidates: Vec<ClassifiedCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassifiedCandidate {
    pub entry_id: String,
    /// 0.0 to 1.0
    pub confidence: f64,
}

/// Model output for question decomposition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecompositionResponse {
    pub sub_questions: Vec<SubQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubQuestion {
    pub id: String,
    pub question: String,
    pub priority: Priority,
    pub evidence: SourceKind,
}

/// Outcome of classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Matched(TargetMatch),
    /// Best confidence was below threshold; carries the top candidates.
    Ambiguous(Vec<Candidate>),
}

/// Remaining time before `deadline`, capped at `cap`.
fn budget(deadline: Instant, cap: std::time::Duration) -> std::time::Duration {
    deadline.saturating_duration_since(Instant::now()).min(cap)
}

/// Call the model and parse the answer, retrying once on a malformed answer
/// or a provider error. Timeouts are not retried.
async fn complete_structured<T, P>(
    model: &dyn LanguageModel,
    request: CompletionRequest,
    strict_request: CompletionRequest,
    config: &ReviewConfig,
    cancel: &CancellationToken,
    deadline: Instant,
    operation: &str,
    parse: P,
) -> Result<Parsed<T>>
where
    P: Fn(&str) -> Parsed<T>,
{
    let mut last = None;
    for request in [&request, &strict_request] {
        let timeout = budget(deadline, config.llm_timeout());
        if timeout.is_zero() {
            return Err(ReviewError::Timeout {
                operation: operation.to_string(),
                millis: 0,
            });
        }

        match guarded(cancel, timeout, operation, model.complete(request)).await {
            Ok(raw) => match parse(&raw) {
                Parsed::Ok(value) => return Ok(Parsed::Ok(value)),
                malformed => {
                    warn!(operation, "malformed model output, retrying with strict instruction");
                    last = Some(Ok(malformed));
                }
            },
            Err(e) if e.is_retryable() => {
                warn!(operation, error = %e, "model call failed, retrying once");
                last = Some(Err(e));
            }
            Err(e) => return Err(e),
        }
    }
    last.unwrap_or_else(|| Err(ReviewError::Internal(format!("{operation}: no attempt made"))))
}

/// Match `input` to an ontology entry.
pub async fn classify(
    model: &dyn LanguageModel,
    ontology: &Ontology,
    input: &str,
    config: &ReviewConfig,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<Classification> {
    let request = CompletionRequest::for_type::<ClassificationResponse>(
        "classification",
        SYSTEM_PROMPT,
        format_classify_prompt(&ontology.entries, input, false),
    );
    let strict = CompletionRequest::for_type::<ClassificationResponse>(
        "classification",
        SYSTEM_PROMPT,
        format_classify_prompt(&ontology.entries, input, true),
    );

    let parsed = complete_structured(
        model,
        request,
        strict,
        config,
        cancel,
        deadline,
        "classification",
        parse_structured::<ClassificationResponse>,
    )
    .await?;

    let response = match parsed {
        Parsed::Ok(response) => response,
        Parsed::Malformed { reason, .. } => {
            warn!(reason = %reason, "classification output malformed twice");
            return Err(ReviewError::MalformedOutput {
                operation: "classification".to_string(),
                reason,
            });
        }
    };

    Ok(rank_candidates(ontology, response, config))
}

/// Keep known entries, clamp and dedupe confidences, and apply the threshold.
pub fn rank_candidates(
    ontology: &Ontology,
    response: ClassificationResponse,
    config: &ReviewConfig,
) -> Classification {
    let mut ranked: Vec<Candidate> = Vec::new();
    for candidate in response.candidates {
        let Some(entry) = ontology.entry(&candidate.entry_id) else {
            debug!(entry_id = %candidate.entry_id, "classifier returned unknown entry");
            continue;
        };
        let confidence = if candidate.confidence.is_finite() {
            candidate.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        match ranked.iter_mut().find(|c| c.entry_id == entry.id) {
            Some(existing) => existing.confidence = existing.confidence.max(confidence),
            None => ranked.push(Candidate {
                entry_id: entry.id.clone(),
                name: entry.name.clone(),
                confidence,
            }),
        }
    }
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    match ranked.first() {
        Some(best) if best.confidence >= config.classification_threshold => {
            Classification::Matched(TargetMatch {
                entry_id: best.entry_id.clone(),
                name: best.name.clone(),
                confidence: best.confidence,
            })
        }
        _ => {
            ranked.truncate(config.candidate_count);
            Classification::Ambiguous(ranked)
        }
    }
}

/// Turn a question into ad-hoc criteria for the matched entry.
///
/// Falls back to the entry's own criteria when the model cannot produce a
/// usable decomposition.
pub async fn decompose(
    model: &dyn LanguageModel,
    entry: &OntologyEntry,
    question: &str,
    config: &ReviewConfig,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<Vec<Criterion>> {
    let prompt = format_decompose_prompt(entry, question, MAX_SUB_QUESTIONS);
    let request = CompletionRequest::for_type::<DecompositionResponse>(
        "decomposition",
        SYSTEM_PROMPT,
        prompt.clone(),
    );
    let strict = CompletionRequest::for_type::<DecompositionResponse>(
        "decomposition",
        SYSTEM_PROMPT,
        format!("{prompt}\n\nRespond with a single JSON object matching the schema."),
    );

    let parsed = complete_structured(
        model,
        request,
        strict,
        config,
        cancel,
        deadline,
        "decomposition",
        parse_structured::<DecompositionResponse>,
    )
    .await;

    let sub_questions = match parsed {
        Ok(Parsed::Ok(response)) => response.sub_questions,
        Ok(Parsed::Malformed { reason, .. }) => {
            warn!(reason = %reason, "decomposition malformed, using entry criteria");
            Vec::new()
        }
        Err(ReviewError::Cancelled) => return Err(ReviewError::Cancelled),
        Err(e) => {
            warn!(error = %e, "decomposition failed, using entry criteria");
            Vec::new()
        }
    };

    let criteria = sub_questions_to_criteria(sub_questions);
    if criteria.is_empty() {
        Ok(entry.criteria.clone())
    } else {
        Ok(criteria)
    }
}

/// Convert sub-questions to criteria with unique, non-empty ids.
pub fn sub_questions_to_criteria(sub_questions: Vec<SubQuestion>) -> Vec<Criterion> {
    let mut seen = HashSet::new();
    sub_questions
        .into_iter()
        .filter(|q| !q.question.trim().is_empty())
        .take(MAX_SUB_QUESTIONS)
        .enumerate()
        .map(|(i, q)| {
            let base = if q.id.trim().is_empty() {
                format!("q{}", i + 1)
            } else {
                q.id.trim().to_string()
            };
            let mut id = base.clone();
            let mut n = 2;
            while !seen.insert(id.clone()) {
                id = format!("{base}-{n}");
                n += 1;
            }
            Criterion::new(id, q.question.trim())
                .with_priority(q.priority)
                .with_required_evidence(q.evidence)
        })
        .collect()
}
