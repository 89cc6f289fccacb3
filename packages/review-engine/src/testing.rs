//! Testing utilities including mock implementations.
//!
//! Deterministic stand-ins for the language model, knowledge sources, the
//! authoritative source and the event publisher, plus fixture builders. All
//! delays go through `tokio::time`, so tests can run with paused time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Result, ReviewError};
use crate::sources::memory::MemoryAuthority;
use crate::traits::knowledge::{AuthoritativeDocument, AuthoritativeSource, KnowledgeSource, SearchQuery};
use crate::traits::model::{CompletionRequest, LanguageModel};
use crate::traits::publisher::EventPublisher;
use crate::types::event::ProgressEvent;
use crate::types::evidence::{Excerpt, Locator, SourceKind};
use crate::types::ids::JobId;

/// What a scripted call does.
#[derive(Debug, Clone)]
pub struct MockReply {
    delay: Duration,
    outcome: MockOutcome,
}

#[derive(Debug, Clone)]
enum MockOutcome {
    Text(String),
    Fail(String),
    Panic(String),
}

impl MockReply {
    /// Return `text` as the raw model output.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MockOutcome::Text(text.into()),
        }
    }

    /// Fail with a provider error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MockOutcome::Fail(message.into()),
        }
    }

    /// Panic inside the call.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: MockOutcome::Panic(message.into()),
        }
    }

    /// Wait `delay` before replying.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn play(self) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.outcome {
            MockOutcome::Text(text) => Ok(text),
            MockOutcome::Fail(message) => Err(ReviewError::Model(message.into())),
            MockOutcome::Panic(message) => panic!("{message}"),
        }
    }
}

struct Script {
    schema_name: String,
    needle: Option<String>,
    replies: Vec<MockReply>,
    played: usize,
}

impl Script {
    fn matches(&self, request: &CompletionRequest) -> bool {
        self.schema_name == request.schema_name
            && self
                .needle
                .as_ref()
                .map_or(true, |needle| request.prompt.contains(needle.as_str()))
    }

    /// Replies play in order; the last one repeats.
    fn next(&mut self) -> Option<MockReply> {
        let reply = self
            .replies
            .get(self.played)
            .or_else(|| self.replies.last())
            .cloned();
        self.played += 1;
        reply
    }
}

/// Record of a call made to the mock model.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub schema_name: String,
    pub prompt: String,
}

/// A scripted language model.
///
/// Scripts are keyed by schema name plus an optional prompt substring and
/// are tried in the order they were added. Verdict scripts registered with
/// [`with_verdict`](Self::with_verdict) match on the criterion name line of
/// the evaluation prompt.
#[derive(Default)]
pub struct MockModel {
    scripts: Mutex<Vec<Script>>,
    default_response: Option<String>,
    calls: RwLock<Vec<MockCall>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response for any call no script matches.
    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = Some(text.into());
        self
    }

    /// Script replies for calls with this schema whose prompt contains
    /// `needle`.
    pub fn with_replies(
        self,
        schema_name: impl Into<String>,
        needle: Option<&str>,
        replies: Vec<MockReply>,
    ) -> Self {
        self.scripts.lock().unwrap().push(Script {
            schema_name: schema_name.into(),
            needle: needle.map(str::to_string),
            replies,
            played: 0,
        });
        self
    }

    /// Classification answer listing `(entry_id, confidence)` candidates.
    pub fn with_classification(self, candidates: &[(&str, f64)]) -> Self {
        let candidates: Vec<_> = candidates
            .iter()
            .map(|(id, confidence)| serde_json::json!({ "entry_id": id, "confidence": confidence }))
            .collect();
        let body = serde_json::json!({ "candidates": candidates }).to_string();
        self.with_replies("classification", None, vec![MockReply::text(body)])
    }

    /// Verdict replies for the criterion with this name.
    pub fn with_verdict_replies(self, criterion_name: &str, replies: Vec<MockReply>) -> Self {
        let needle = format!("Criterion: {criterion_name}\n");
        self.with_replies("structured_verdict", Some(&needle), replies)
    }

    /// A single verdict for the criterion with this name.
    pub fn with_verdict(self, criterion_name: &str, verdict_json: impl Into<String>) -> Self {
        self.with_verdict_replies(criterion_name, vec![MockReply::text(verdict_json)])
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// Number of calls made with this schema name.
    pub fn calls_for(&self, schema_name: &str) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.schema_name == schema_name)
            .count()
    }

    fn reply_for(&self, request: &CompletionRequest) -> Option<MockReply> {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some(script) = scripts.iter_mut().find(|s| s.matches(request)) {
            return script.next();
        }
        self.default_response.clone().map(MockReply::text)
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.write().unwrap().push(MockCall {
            schema_name: request.schema_name.clone(),
            prompt: request.prompt.clone(),
        });

        match self.reply_for(request) {
            Some(reply) => reply.play().await,
            None => Err(ReviewError::Model(
                format!("no scripted response for {}", request.schema_name).into(),
            )),
        }
    }
}

/// A knowledge source returning fixed excerpts.
///
/// Excerpts registered with a needle are only returned when the query text
/// contains it (case-insensitive).
pub struct MockKnowledgeSource {
    name: String,
    kind: SourceKind,
    excerpts: Vec<(Option<String>, Excerpt)>,
    failure: Option<String>,
    delay: Duration,
    searches: RwLock<Vec<SearchQuery>>,
}

impl MockKnowledgeSource {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            excerpts: Vec::new(),
            failure: None,
            delay: Duration::ZERO,
            searches: RwLock::new(Vec::new()),
        }
    }

    /// Excerpt returned for every query.
    pub fn with_excerpt(mut self, identifier: &str, text: &str) -> Self {
        let excerpt = Excerpt::new(Locator::new(self.kind, identifier), text).with_score(1.0);
        self.excerpts.push((None, excerpt));
        self
    }

    /// Excerpt returned only for queries mentioning `needle`.
    pub fn with_excerpt_for(mut self, needle: &str, identifier: &str, text: &str) -> Self {
        let excerpt = Excerpt::new(Locator::new(self.kind, identifier), text).with_score(1.0);
        self.excerpts.push((Some(needle.to_lowercase()), excerpt));
        self
    }

    /// Every search fails.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn search_count(&self) -> usize {
        self.searches.read().unwrap().len()
    }

    pub fn searches(&self) -> Vec<SearchQuery> {
        self.searches.read().unwrap().clone()
    }
}

#[async_trait]
impl KnowledgeSource for MockKnowledgeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Excerpt>> {
        self.searches.write().unwrap().push(query.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(ReviewError::Source(message.clone().into()));
        }

        let text = query.text.to_lowercase();
        Ok(self
            .excerpts
            .iter()
            .filter(|(needle, _)| needle.as_ref().map_or(true, |n| text.contains(n.as_str())))
            .map(|(_, excerpt)| excerpt.clone())
            .take(query.limit)
            .collect())
    }
}

/// An authoritative source over a fixed document set that can be made
/// unreachable, wholesale or per identifier.
#[derive(Default)]
pub struct MockAuthority {
    documents: MemoryAuthority,
    unreachable: bool,
    unreachable_ids: Vec<String>,
    delay: Duration,
    lookups: RwLock<Vec<Locator>>,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, document: AuthoritativeDocument) -> Self {
        self.documents.insert(document);
        self
    }

    /// Convenience for an in-force document.
    pub fn with_text(self, locator: Locator, text: &str) -> Self {
        self.with_document(AuthoritativeDocument::new(locator, text))
    }

    /// Every lookup fails.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Lookups of this identifier fail.
    pub fn unreachable_for(mut self, identifier: &str) -> Self {
        self.unreachable_ids.push(identifier.to_lowercase());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.read().unwrap().len()
    }
}

#[async_trait]
impl AuthoritativeSource for MockAuthority {
    async fn lookup(&self, locator: &Locator) -> Result<Option<AuthoritativeDocument>> {
        self.lookups.write().unwrap().push(locator.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unreachable
            || self
                .unreachable_ids
                .contains(&locator.identifier.to_lowercase())
        {
            return Err(ReviewError::Source(
                format!("authority unreachable for {locator}").into(),
            ));
        }
        self.documents.lookup(locator).await
    }
}

/// Publisher that keeps every event, for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ProgressEvent>>,
    notify: Notify,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, job_id: JobId) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn terminal_events(&self, job_id: JobId) -> Vec<ProgressEvent> {
        self.events_for(job_id)
            .into_iter()
            .filter(ProgressEvent::is_terminal)
            .collect()
    }

    /// Wait until the job's terminal event has been published.
    pub async fn wait_for_terminal(&self, job_id: JobId) -> ProgressEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.terminal_events(job_id).into_iter().next() {
                return event;
            }
            notified.await;
        }
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }
}

/// Fixture builders shared by unit and integration tests.
pub mod fixtures {
    use chrono::Utc;

    use crate::pipeline::rollup::rollup;
    use crate::types::citation::VerificationSummary;
    use crate::types::config::RollupPolicy;
    use crate::types::evidence::{EvidenceSummary, SourceKind};
    use crate::types::ids::{JobId, RequesterId, TenantId};
    use crate::types::job::{ReviewInput, ReviewRequest, TargetMatch};
    use crate::types::ontology::{Criterion, Ontology, OntologyEntry, Priority, StructuralElement};
    use crate::types::result::{Confidence, ReviewResult};
    use crate::types::verdict::{Rating, Verdict};

    /// Names of the five criteria in [`privacy_entry`], in order.
    pub const PRIVACY_CRITERIA: [&str; 5] = [
        "Lawful basis",
        "Breach notification",
        "Data subject rights",
        "Retention schedule",
        "International transfers",
    ];

    /// A privacy-policy entry with five criteria (the second one high
    /// priority) and two required structural elements.
    pub fn privacy_entry() -> OntologyEntry {
        let priorities = [
            Priority::Medium,
            Priority::High,
            Priority::Medium,
            Priority::Low,
            Priority::Medium,
        ];
        let mut entry = OntologyEntry::new("privacy", "Privacy policy")
            .with_description("How the organisation handles personal data")
            .with_element(
                StructuralElement::new("Contact details", Priority::Medium)
                    .with_markers(["contact us", "data protection officer"]),
            )
            .with_element(StructuralElement::new("Effective date", Priority::Low).with_markers(["effective"]));
        for (i, (name, priority)) in PRIVACY_CRITERIA.iter().zip(priorities).enumerate() {
            entry = entry.with_criterion(
                Criterion::new(format!("p{}", i + 1), *name)
                    .with_description(format!("The policy addresses {}", name.to_lowercase()))
                    .with_priority(priority),
            );
        }
        entry
    }

    /// Privacy plus an HR handbook entry.
    pub fn ontology() -> Ontology {
        Ontology::new(vec![
            privacy_entry(),
            OntologyEntry::new("hr", "HR handbook").with_criterion(
                Criterion::new("h1", "Grievance procedure").with_priority(Priority::High),
            ),
        ])
    }

    /// Document text containing both privacy structural elements.
    pub const PRIVACY_DOCUMENT: &str = "Privacy policy. Effective 1 May 2024. We process personal \
data on the basis of consent. Breaches are reported to the regulator within 72 hours. Contact us \
at privacy@example.org.";

    pub fn document_request(tenant_id: TenantId) -> ReviewRequest {
        ReviewRequest::new(
            tenant_id,
            RequesterId::new(),
            ReviewInput::document("privacy.pdf", PRIVACY_DOCUMENT),
        )
    }

    pub fn question_request(tenant_id: TenantId, question: &str) -> ReviewRequest {
        ReviewRequest::new(tenant_id, RequesterId::new(), ReviewInput::question(question))
    }

    /// Raw verdict JSON as the model would return it. Citations are
    /// `(identifier, section, quote)` against legislation.
    pub fn verdict_json(rating: Rating, justification: &str, citations: &[(&str, &str, &str)]) -> String {
        let citations: Vec<_> = citations
            .iter()
            .map(|(identifier, section, quote)| {
                serde_json::json!({
                    "locator": {
                        "source": SourceKind::Legislation,
                        "identifier": identifier,
                        "section": section,
                    },
                    "quote": quote,
                })
            })
            .collect();
        serde_json::json!({
            "rating": rating,
            "justification": justification,
            "citations": citations,
            "remediations": if rating == Rating::Green { vec![] } else { vec!["Update the policy"] },
        })
        .to_string()
    }

    /// A finished result with one high-priority verdict per `(criterion id,
    /// rating)` pair and the overall rating rolled up from them.
    pub fn result(target_id: &str, ratings: &[(&str, Rating)]) -> ReviewResult {
        let criteria: Vec<Criterion> = ratings
            .iter()
            .map(|(id, _)| Criterion::new(*id, *id).with_priority(Priority::High))
            .collect();
        let verdicts: Vec<Verdict> = ratings
            .iter()
            .map(|(id, rating)| Verdict {
                criterion_id: id.to_string(),
                rating: *rating,
                justification: format!("{id} is {rating}"),
                citations: Vec::new(),
                remediations: Vec::new(),
                evidence: EvidenceSummary::default(),
                capped: false,
            })
            .collect();
        let overall = rollup(&criteria, &verdicts, verdicts.len(), &RollupPolicy::default());

        ReviewResult {
            job_id: JobId::new(),
            target: TargetMatch {
                entry_id: target_id.to_string(),
                name: target_id.to_string(),
                confidence: 1.0,
            },
            overall,
            confidence: Confidence::High,
            verdicts,
            failed: Vec::new(),
            gaps: Vec::new(),
            actions: Vec::new(),
            citations: Vec::new(),
            verification: VerificationSummary::default(),
            assembled_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::verdict::{Rating, StructuredVerdict};

    fn verdict_request(criterion: &str) -> CompletionRequest {
        CompletionRequest::for_type::<StructuredVerdict>(
            "structured_verdict",
            "system",
            format!("Evaluate.\n\nCriterion: {criterion}\nDescription: x"),
        )
    }

    #[tokio::test]
    async fn test_mock_model_routes_by_criterion_and_repeats_last() {
        let model = MockModel::new()
            .with_verdict_replies(
                "Breach notification",
                vec![MockReply::text("not json"), MockReply::text("{}")],
            )
            .with_verdict("Lawful basis", fixtures::verdict_json(Rating::Green, "ok", &[]));

        let breach = verdict_request("Breach notification");
        assert_eq!(model.complete(&breach).await.unwrap(), "not json");
        assert_eq!(model.complete(&breach).await.unwrap(), "{}");
        assert_eq!(model.complete(&breach).await.unwrap(), "{}");

        let lawful = model.complete(&verdict_request("Lawful basis")).await.unwrap();
        let parsed: StructuredVerdict = serde_json::from_str(&lawful).unwrap();
        assert_eq!(parsed.rating, Rating::Green);

        assert!(model.complete(&verdict_request("Unknown")).await.is_err());
        assert_eq!(model.calls_for("structured_verdict"), 5);
    }

    #[tokio::test]
    async fn test_mock_source_filters_by_needle() {
        let source = MockKnowledgeSource::new("library", SourceKind::TenantDocument)
            .with_excerpt("always", "shown for every query")
            .with_excerpt_for("breach", "breach", "reported within 72 hours");

        let tenant = crate::types::ids::TenantId::new();
        let hits = source
            .search(&SearchQuery::new("Breach notification", tenant))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let hits = source
            .search(&SearchQuery::new("Lawful basis", tenant))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(source.search_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_authority_unreachable_for_identifier() {
        let gdpr = Locator::new(SourceKind::Legislation, "GDPR");
        let authority = MockAuthority::new()
            .with_text(gdpr.clone(), "text")
            .unreachable_for("DPA 2018");

        assert!(authority.lookup(&gdpr).await.unwrap().is_some());
        assert!(authority
            .lookup(&Locator::new(SourceKind::Legislation, "DPA 2018"))
            .await
            .is_err());
        assert_eq!(authority.lookup_count(), 2);
    }

    #[test]
    fn test_fixture_result_rolls_up() {
        assert_eq!(
            fixtures::result("privacy", &[("a", Rating::Green), ("b", Rating::Red)]).overall,
            Rating::Red
        );
        assert_eq!(
            fixtures::result("privacy", &[("a", Rating::Green)]).overall,
            Rating::Green
        );
    }
}
